//! Configuration for the getfile server and client.
//!
//! The server accepts command-line arguments and an optional TOML file;
//! CLI arguments take precedence over config file values. The client is
//! configured from the command line only.

use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Default idle read deadline for a server connection, in seconds
pub const DEFAULT_IDLE_TIMEOUT: u64 = 55;

/// Default read deadline on the client, in seconds
pub const DEFAULT_READ_TIMEOUT: u64 = 6;

/// Default connect deadline on the client, in seconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Default bound on concurrently served connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Command-line arguments for the file server
#[derive(Parser, Debug)]
#[command(name = "getfiled")]
#[command(author = "getfile authors")]
#[command(version = "0.1.0")]
#[command(about = "Serves files over the GET/QUIT transfer protocol", long_about = None)]
pub struct ServerArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (defaults to dual-stack [::])
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Directory files are served from
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Idle read deadline per connection, in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Maximum number of connections served at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the file client
#[derive(Parser, Debug)]
#[command(name = "getfile")]
#[command(author = "getfile authors")]
#[command(version = "0.1.0")]
#[command(about = "Fetches files from a getfiled server", long_about = None)]
pub struct ClientArgs {
    /// Server address (IPv4, IPv6 or host name)
    pub address: String,

    /// Server port
    pub port: u16,

    /// Files to request, in order
    #[arg(required = true)]
    pub files: Vec<String>,

    /// Read deadline, in seconds
    #[arg(short, long, default_value_t = DEFAULT_READ_TIMEOUT)]
    pub timeout: u64,

    /// Connect deadline, in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: u64,

    /// Directory received files are written to
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    pub host: Option<IpAddr>,
    /// Port to listen on
    pub port: Option<u16>,
    /// Directory files are served from
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Idle read deadline in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            root: default_root(),
            idle_timeout: default_idle_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Explicit bind address; `None` means dual-stack any
    pub host: Option<IpAddr>,
    pub port: u16,
    pub root: PathBuf,
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    /// Resolve already-parsed arguments against the optional TOML file.
    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: ServerArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;

        let idle_timeout = cli.timeout.unwrap_or(toml_config.server.idle_timeout);
        if idle_timeout == 0 {
            return Err(ConfigError::Invalid("timeout must be at least 1 second"));
        }

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        let max_connections = max_connections.min(Semaphore::MAX_PERMITS);

        Ok(ServerConfig {
            host: cli.host.or(toml_config.server.host),
            port,
            root: cli.root.unwrap_or(toml_config.server.root),
            idle_timeout: Duration::from_secs(idle_timeout),
            max_connections,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    pub files: Vec<String>,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub output_dir: PathBuf,
    pub log_level: String,
}

impl ClientConfig {
    pub fn load() -> Self {
        Self::from(ClientArgs::parse())
    }
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        ClientConfig {
            address: args.address,
            port: args.port,
            files: args.files,
            read_timeout: Duration::from_secs(args.timeout.max(1)),
            connect_timeout: Duration::from_secs(args.connect_timeout.max(1)),
            output_dir: args.output_dir,
            log_level: args.log_level,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingPort => {
                write!(f, "No port given on the command line or in the config file")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, None);
        assert_eq!(config.server.port, None);
        assert_eq!(config.server.root, PathBuf::from("."));
        assert_eq!(config.server.idle_timeout, 55);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "::"
            port = 2000
            root = "/srv/files"
            idle_timeout = 30
            max_connections = 64

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, Some("::".parse().unwrap()));
        assert_eq!(config.server.port, Some(2000));
        assert_eq!(config.server.root, PathBuf::from("/srv/files"));
        assert_eq!(config.server.idle_timeout, 30);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_takes_precedence() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 2000
            idle_timeout = 30
            [logging]
            level = "debug"
        "#,
        )
        .unwrap();
        let cli = ServerArgs::try_parse_from(["getfiled", "3000", "-t", "5"]).unwrap();

        let config = ServerConfig::merge(cli, toml_config).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_port_required() {
        let cli = ServerArgs::try_parse_from(["getfiled"]).unwrap();
        let result = ServerConfig::merge(cli, TomlConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingPort)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let cli = ServerArgs::try_parse_from(["getfiled", "2000", "--timeout", "0"]).unwrap();
        let result = ServerConfig::merge(cli, TomlConfig::default());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_max_connections_capped() {
        let huge = usize::MAX.to_string();
        let cli =
            ServerArgs::try_parse_from(["getfiled", "2000", "--max-connections", huge.as_str()])
                .unwrap();
        let config = ServerConfig::merge(cli, TomlConfig::default()).unwrap();
        assert_eq!(config.max_connections, Semaphore::MAX_PERMITS);

        // Must not panic
        let _ = Semaphore::new(config.max_connections);
    }

    #[test]
    fn test_client_args() {
        let args = ClientArgs::try_parse_from([
            "getfile",
            "127.0.0.1",
            "2000",
            "a.txt",
            "dir/b.txt",
        ])
        .unwrap();
        let config = ClientConfig::from(args);
        assert_eq!(config.port, 2000);
        assert_eq!(config.files, vec!["a.txt", "dir/b.txt"]);
        assert_eq!(config.read_timeout, Duration::from_secs(6));
        assert_eq!(config.output_dir, PathBuf::from("."));
    }

    #[test]
    fn test_client_requires_a_file() {
        assert!(ClientArgs::try_parse_from(["getfile", "127.0.0.1", "2000"]).is_err());
    }
}
