//! Reliable I/O over a byte stream.
//!
//! Every operation here either moves exactly the requested number of bytes
//! or fails. Short reads and writes from the transport are accumulated,
//! `Interrupted` is retried, and reads can be bounded by a deadline so an
//! idle peer surfaces as [`IoError::Timeout`] rather than a generic failure.

use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Failure of a reliable read or write.
#[derive(Debug)]
pub enum IoError {
    /// No data arrived before the deadline.
    Timeout,
    /// The stream ended before the requested count was reached.
    Closed {
        /// Bytes moved before the stream ended.
        transferred: usize,
        /// Bytes the caller asked for.
        expected: usize,
    },
    /// A line did not end within `limit` bytes.
    Overflow { limit: usize },
    /// Any other transport failure.
    Io(io::Error),
}

impl IoError {
    /// True when the failure was a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IoError::Timeout)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Timeout => write!(f, "timed out waiting for data"),
            IoError::Closed {
                transferred,
                expected,
            } => write!(
                f,
                "connection closed after {} of {} bytes",
                transferred, expected
            ),
            IoError::Overflow { limit } => write!(f, "line exceeds {} bytes", limit),
            IoError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // SO_RCVTIMEO style expiry reported by the transport itself
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => IoError::Timeout,
            _ => IoError::Io(e),
        }
    }
}

/// Read exactly `buf.len()` bytes.
///
/// With `timeout` set, the whole read must complete before
/// `now + timeout`. End-of-stream before the buffer is full is
/// [`IoError::Closed`]; a partial count is never reported as success.
pub async fn read_exact<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<(), IoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut filled = 0;

    while filled < buf.len() {
        match read_before(reader, &mut buf[filled..], deadline).await {
            Ok(0) => {
                return Err(IoError::Closed {
                    transferred: filled,
                    expected: buf.len(),
                })
            }
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Perform a single read of at most `buf.len()` bytes.
///
/// Returns `Ok(0)` on end-of-stream. Used where the caller accounts for
/// partial progress itself.
pub async fn read_some<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize, IoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    read_before(reader, buf, deadline).await
}

/// Read one LF-terminated line of at most `limit` bytes, terminator
/// included.
///
/// Bytes are pulled one at a time so nothing past the terminator is ever
/// consumed; the caller can keep issuing exact reads on the same stream.
pub async fn read_line<R>(
    reader: &mut R,
    limit: usize,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, IoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    while line.len() < limit {
        match read_before(reader, &mut byte, deadline).await? {
            0 => {
                return Err(IoError::Closed {
                    transferred: line.len(),
                    expected: line.len() + 1,
                })
            }
            _ => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    return Ok(line);
                }
            }
        }
    }

    Err(IoError::Overflow { limit })
}

/// Write all of `data`, then flush.
pub async fn write_exact<W>(writer: &mut W, data: &[u8]) -> Result<(), IoError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;

    while written < data.len() {
        match writer.write(&data[written..]).await {
            Ok(0) => {
                return Err(IoError::Closed {
                    transferred: written,
                    expected: data.len(),
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => {
                return Err(IoError::Closed {
                    transferred: written,
                    expected: data.len(),
                })
            }
            Err(e) => return Err(IoError::Io(e)),
        }
    }

    loop {
        match writer.flush().await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IoError::Io(e)),
        }
    }
}

/// One read attempt, retried on `Interrupted`, bounded by `deadline`.
async fn read_before<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<usize, IoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, reader.read(buf))
                .await
                .map_err(|_| IoError::Timeout)?,
            None => reader.read(buf).await,
        };

        match result {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => return Ok(0),
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
