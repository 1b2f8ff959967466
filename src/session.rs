//! Per-connection protocol state machine.
//!
//! A session reads commands strictly one at a time:
//!
//! ```text
//! AwaitingCommand ──GET ok──▶ Serving ──sent──▶ AwaitingCommand
//!        │                       │
//!        │ malformed             │ refused
//!        ▼                       ▼
//!     Closing ───── -ERR ────▶ Terminated ◀── QUIT / timeout / I/O error
//! ```
//!
//! Framing violations are never recovered from: once the byte stream is
//! misaligned the session replies `-ERR` (when a reply is still
//! unambiguous) and closes.

use crate::protocol::{self, FileMetadata, ParseError, Prefix, Request};
use crate::stream::{self, IoError};
use crate::transfer::{self, TransferError};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Why a request was answered with `-ERR`.
#[derive(Debug)]
pub enum Refusal {
    /// Command did not frame correctly
    Malformed(ParseError),
    /// Filename would resolve outside the served directory
    OutsideRoot(String),
    /// No such file
    NotFound(String),
    /// File exists but cannot be opened for reading
    Unreadable(String, io::Error),
    /// Directory, socket, device...
    NotRegularFile(String),
    /// Size or timestamp could not be read
    Metadata(String, io::Error),
    /// Size does not fit the 32-bit header field
    TooLarge(String, u64),
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::Malformed(e) => write!(f, "illegal command: {}", e),
            Refusal::OutsideRoot(name) => {
                write!(f, "requested '{}' outside the served directory", name)
            }
            Refusal::NotFound(name) => write!(f, "file '{}' not found", name),
            Refusal::Unreadable(name, e) => write!(f, "file '{}' not readable: {}", name, e),
            Refusal::NotRegularFile(name) => write!(f, "'{}' is not a regular file", name),
            Refusal::Metadata(name, e) => write!(f, "stat of '{}' failed: {}", name, e),
            Refusal::TooLarge(name, size) => {
                write!(f, "file '{}' is {} bytes, too large to announce", name, size)
            }
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Client sent `QUIT\r\n`
    Quit { files_served: usize },
    /// A request was answered with `-ERR`
    Refused(Refusal),
    /// No complete command within the idle deadline
    Timeout,
    /// Peer closed or the transport failed between commands
    Disconnected(IoError),
    /// The header went out but the file body did not complete
    TransferInterrupted(TransferError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Quit { files_served } => {
                write!(f, "client served ({} files)", files_served)
            }
            SessionEnd::Refused(refusal) => write!(f, "refused: {}", refusal),
            SessionEnd::Timeout => write!(f, "timeout waiting for data"),
            SessionEnd::Disconnected(e) => write!(f, "disconnected: {}", e),
            SessionEnd::TransferInterrupted(e) => write!(f, "transfer interrupted: {}", e),
        }
    }
}

enum State {
    AwaitingCommand,
    Serving(String),
    Closing(Refusal),
    Terminated(SessionEnd),
}

/// One accepted connection and the directory it is served from.
pub struct Session {
    stream: TcpStream,
    root: Arc<PathBuf>,
    idle_timeout: Duration,
    files_served: usize,
}

impl Session {
    pub fn new(stream: TcpStream, root: Arc<PathBuf>, idle_timeout: Duration) -> Self {
        Self {
            stream,
            root,
            idle_timeout,
            files_served: 0,
        }
    }

    /// Serve commands until the session terminates. The connection is
    /// closed when this returns.
    pub async fn run(mut self) -> SessionEnd {
        let mut state = State::AwaitingCommand;

        loop {
            state = match state {
                State::AwaitingCommand => self.await_command().await,
                State::Serving(filename) => self.serve(filename).await,
                State::Closing(refusal) => self.close_with_error(refusal).await,
                State::Terminated(end) => return end,
            };
        }
    }

    async fn await_command(&mut self) -> State {
        match self.read_request().await {
            Ok(Request::Get { filename }) => State::Serving(filename),
            Ok(Request::Quit) => {
                info!(files = self.files_served, "client served");
                State::Terminated(SessionEnd::Quit {
                    files_served: self.files_served,
                })
            }
            Ok(Request::Malformed(e)) => {
                warn!(error = %e, "illegal command, closing");
                State::Closing(Refusal::Malformed(e))
            }
            Err(e) if e.is_timeout() => {
                warn!("timeout waiting for data, closing");
                State::Terminated(SessionEnd::Timeout)
            }
            Err(e) => {
                debug!(error = %e, "connection dropped");
                State::Terminated(SessionEnd::Disconnected(e))
            }
        }
    }

    /// Read and frame one command.
    ///
    /// Transport failures are returned as `Err`; anything that arrived but
    /// does not frame correctly is `Request::Malformed`.
    async fn read_request(&mut self) -> Result<Request, IoError> {
        let timeout = Some(self.idle_timeout);
        let mut prefix = [0u8; 4];
        stream::read_exact(&mut self.stream, &mut prefix, timeout).await?;

        match Prefix::classify(&prefix) {
            Prefix::Get => {
                match stream::read_line(&mut self.stream, protocol::MAX_LINE_LEN, timeout).await {
                    Ok(line) => Ok(match protocol::parse_filename(&line) {
                        Ok(filename) => Request::Get { filename },
                        Err(e) => Request::Malformed(e),
                    }),
                    Err(IoError::Overflow { limit }) => Ok(Request::Malformed(
                        ParseError::FilenameTooLong(limit),
                    )),
                    Err(IoError::Closed { .. }) => {
                        Ok(Request::Malformed(ParseError::MissingTerminator))
                    }
                    Err(e) => Err(e),
                }
            }
            Prefix::Quit => {
                let mut terminator = [0u8; 2];
                stream::read_exact(&mut self.stream, &mut terminator, timeout).await?;
                if &terminator == protocol::CRLF {
                    Ok(Request::Quit)
                } else {
                    Ok(Request::Malformed(ParseError::MissingTerminator))
                }
            }
            Prefix::Unknown(bytes) => Ok(Request::Malformed(ParseError::UnknownCommand(bytes))),
        }
    }

    async fn serve(&mut self, filename: String) -> State {
        info!(file = %filename, "file requested");

        let (file, meta) = match self.resolve(&filename).await {
            Ok(opened) => opened,
            Err(refusal) => {
                warn!(reason = %refusal, "request refused, closing");
                return State::Closing(refusal);
            }
        };

        let header = meta.encode_reply();
        if let Err(e) = stream::write_exact(&mut self.stream, &header).await {
            warn!(error = %e, "failed to send reply header");
            return State::Terminated(SessionEnd::Disconnected(e));
        }

        match transfer::send_file(&mut self.stream, file, u64::from(meta.size)).await {
            Ok(sent) => {
                self.files_served += 1;
                info!(file = %filename, bytes = sent, "file sent");
                State::AwaitingCommand
            }
            Err(e) => {
                warn!(file = %filename, error = %e, "transfer incomplete, disconnecting");
                State::Terminated(SessionEnd::TransferInterrupted(e))
            }
        }
    }

    /// Open and stat the file on the blocking pool.
    async fn resolve(&self, filename: &str) -> Result<(std::fs::File, FileMetadata), Refusal> {
        let root = Arc::clone(&self.root);
        let name = filename.to_string();

        tokio::task::spawn_blocking(move || open_for_transfer(&root, &name))
            .await
            .unwrap_or_else(|e| {
                Err(Refusal::Unreadable(
                    filename.to_string(),
                    io::Error::new(io::ErrorKind::Other, e),
                ))
            })
    }

    async fn close_with_error(&mut self, refusal: Refusal) -> State {
        if let Err(e) = stream::write_exact(&mut self.stream, protocol::ERR_REPLY).await {
            warn!(error = %e, "failed to send error reply");
        }
        let _ = self.stream.shutdown().await;
        State::Terminated(SessionEnd::Refused(refusal))
    }
}

/// Resolve `filename` under `root`, open it and capture its metadata from
/// the opened handle so size and timestamp describe the streamed bytes.
fn open_for_transfer(root: &Path, filename: &str) -> Result<(std::fs::File, FileMetadata), Refusal> {
    if protocol::escapes_root(filename) {
        return Err(Refusal::OutsideRoot(filename.to_string()));
    }

    let path = root.join(filename);
    let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Refusal::NotFound(filename.to_string()),
        _ => Refusal::Unreadable(filename.to_string(), e),
    })?;

    let metadata = file
        .metadata()
        .map_err(|e| Refusal::Metadata(filename.to_string(), e))?;
    if !metadata.is_file() {
        return Err(Refusal::NotRegularFile(filename.to_string()));
    }

    let size = u32::try_from(metadata.len())
        .map_err(|_| Refusal::TooLarge(filename.to_string(), metadata.len()))?;
    let modified = metadata
        .modified()
        .map_err(|e| Refusal::Metadata(filename.to_string(), e))?;

    Ok((
        file,
        FileMetadata {
            size,
            modified_at: unix_seconds(modified),
        },
    ))
}

/// Seconds since the epoch, clamped to the 32-bit header field.
fn unix_seconds(time: SystemTime) -> u32 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX),
        Err(_) => 0,
    }
}
