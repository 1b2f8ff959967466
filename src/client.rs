//! Client side of the file transfer protocol.
//!
//! One connection carries every request of a run. Files are requested in
//! order; the first server error or protocol violation ends the whole run,
//! and `QUIT\r\n` is sent before the connection is closed either way.

use crate::protocol::{self, FileMetadata, ParseError, ReplyPrefix};
use crate::stream::{self, IoError};
use crate::transfer::{self, TransferError, TransferProgress};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Callback invoked after every received chunk.
pub type ProgressFn = Box<dyn FnMut(&str, &TransferProgress) + Send>;

/// Failures that end a client run.
#[derive(Debug)]
pub enum ClientError {
    /// Host name resolution failed
    Resolve(String, io::Error),
    /// Resolution produced no addresses
    NoAddress(String),
    /// Every resolved address refused or timed out
    Connect(SocketAddrList, io::Error),
    /// Filename cannot be sent as a `GET` line
    InvalidFilename(String, ParseError),
    /// Filename has no final component to store locally
    NoBasename(String),
    /// Transport failure or timeout while talking to the server
    Io(IoError),
    /// Server answered `-ERR`
    ServerError(String),
    /// Server answered something that is neither `+OK` nor `-ERR`
    InvalidReply(Vec<u8>),
    /// File body did not arrive intact
    Transfer(TransferError),
}

/// Addresses tried during connect, for error reporting.
#[derive(Debug)]
pub struct SocketAddrList(pub Vec<std::net::SocketAddr>);

impl fmt::Display for SocketAddrList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs: Vec<String> = self.0.iter().map(|a| a.to_string()).collect();
        write!(f, "{}", addrs.join(", "))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Resolve(host, e) => write!(f, "cannot resolve '{}': {}", host, e),
            ClientError::NoAddress(host) => write!(f, "no addresses for '{}'", host),
            ClientError::Connect(addrs, e) => write!(f, "connect to {} failed: {}", addrs, e),
            ClientError::InvalidFilename(name, e) => {
                write!(f, "cannot request '{}': {}", name, e)
            }
            ClientError::NoBasename(name) => {
                write!(f, "'{}' does not name a file", name)
            }
            ClientError::Io(IoError::Timeout) => write!(f, "timeout waiting for the server"),
            ClientError::Io(e) => write!(f, "connection error: {}", e),
            ClientError::ServerError(name) => {
                write!(f, "server error while requesting '{}'", name)
            }
            ClientError::InvalidReply(bytes) => {
                write!(f, "invalid response: {:?}", String::from_utf8_lossy(bytes))
            }
            ClientError::Transfer(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<IoError> for ClientError {
    fn from(e: IoError) -> Self {
        ClientError::Io(e)
    }
}

impl From<TransferError> for ClientError {
    fn from(e: TransferError) -> Self {
        ClientError::Transfer(e)
    }
}

/// Resolve `host:port` and connect to the first address that answers
/// within `connect_timeout`.
pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream, ClientError> {
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ClientError::Resolve(host.to_string(), e))?
        .collect();
    if addrs.is_empty() {
        return Err(ClientError::NoAddress(host.to_string()));
    }

    let mut last_error = None;
    for addr in &addrs {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(*addr)).await {
            Ok(Ok(stream)) => {
                info!(peer = %addr, "Connected");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(peer = %addr, error = %e, "Connect failed");
                last_error = Some(e);
            }
            Err(_) => {
                debug!(peer = %addr, "Connect timed out");
                last_error = Some(io::ErrorKind::TimedOut.into());
            }
        }
    }

    Err(ClientError::Connect(
        SocketAddrList(addrs),
        last_error.unwrap_or_else(|| io::ErrorKind::NotConnected.into()),
    ))
}

/// A file stored locally after a successful `GET`.
#[derive(Debug)]
pub struct Fetched {
    pub requested: String,
    pub local_path: PathBuf,
    pub metadata: FileMetadata,
    pub progress: TransferProgress,
}

/// Request driver over one established connection.
pub struct Client {
    stream: TcpStream,
    read_timeout: Duration,
    output_dir: PathBuf,
    on_progress: Option<ProgressFn>,
}

impl Client {
    pub fn new(stream: TcpStream, read_timeout: Duration, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            stream,
            read_timeout,
            output_dir: output_dir.into(),
            on_progress: None,
        }
    }

    /// Report progress of each file through `f`.
    pub fn with_progress(mut self, f: ProgressFn) -> Self {
        self.on_progress = Some(f);
        self
    }

    /// Request every file in order, stopping at the first failure.
    ///
    /// The connection is always finished with `QUIT\r\n` and closed,
    /// whichever way the run ends. On failure the files fetched before it
    /// are not returned; they stay on disk.
    pub async fn fetch_all<S: AsRef<str>>(mut self, filenames: &[S]) -> Result<Vec<Fetched>, ClientError> {
        let mut fetched = Vec::with_capacity(filenames.len());
        let mut result = Ok(());

        for name in filenames {
            match self.fetch(name.as_ref()).await {
                Ok(file) => fetched.push(file),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.quit().await;
        result.map(|()| fetched)
    }

    /// Request one file and store it under the output directory.
    pub async fn fetch(&mut self, filename: &str) -> Result<Fetched, ClientError> {
        let local_path = self.local_path(filename)?;
        let command = protocol::encode_get(filename)
            .map_err(|e| ClientError::InvalidFilename(filename.to_string(), e))?;

        stream::write_exact(&mut self.stream, &command).await?;
        info!(file = %filename, "file requested, waiting for response");

        let timeout = Some(self.read_timeout);
        let mut prefix = [0u8; protocol::REPLY_PREFIX_LEN];
        stream::read_exact(&mut self.stream, &mut prefix, timeout).await?;

        match ReplyPrefix::classify(&prefix) {
            ReplyPrefix::Ok => {
                let mut fields = [0u8; protocol::HEADER_FIELDS_LEN];
                stream::read_exact(&mut self.stream, &mut fields, timeout).await?;
                let metadata = FileMetadata::decode_fields(&fields);
                debug!(size = metadata.size, modified_at = metadata.modified_at, "reply header");

                let on_progress = &mut self.on_progress;
                let progress = transfer::receive_file(
                    &mut self.stream,
                    &local_path,
                    metadata.size,
                    timeout,
                    |p| {
                        if let Some(f) = on_progress.as_mut() {
                            f(filename, p)
                        }
                    },
                )
                .await?;

                Ok(Fetched {
                    requested: filename.to_string(),
                    local_path,
                    metadata,
                    progress,
                })
            }
            ReplyPrefix::Err => {
                let mut last = [0u8; 1];
                stream::read_exact(&mut self.stream, &mut last, timeout).await?;
                if ReplyPrefix::completes_err(last[0]) {
                    warn!(file = %filename, "server error");
                    Err(ClientError::ServerError(filename.to_string()))
                } else {
                    let mut reply = prefix.to_vec();
                    reply.push(last[0]);
                    Err(ClientError::InvalidReply(reply))
                }
            }
            ReplyPrefix::Invalid(bytes) => Err(ClientError::InvalidReply(bytes.to_vec())),
        }
    }

    /// Where `filename` is stored: its basename inside the output directory.
    fn local_path(&self, filename: &str) -> Result<PathBuf, ClientError> {
        Path::new(filename)
            .file_name()
            .map(|name| self.output_dir.join(name))
            .ok_or_else(|| ClientError::NoBasename(filename.to_string()))
    }

    /// Send `QUIT\r\n` and close. Consumes the client so this happens once.
    async fn quit(mut self) {
        if let Err(e) = stream::write_exact(&mut self.stream, protocol::QUIT_COMMAND).await {
            debug!(error = %e, "QUIT not delivered");
        }
        let _ = self.stream.shutdown().await;
    }
}
