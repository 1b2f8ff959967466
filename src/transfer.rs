//! File transfer engine.
//!
//! Server side: stream a file straight from disk to the connection and
//! verify the byte count against the size announced in the header.
//!
//! Client side: receive exactly the announced number of bytes into a
//! fresh local file, tracking progress, and remove the file again if the
//! stream ends early so no corrupt data is left behind.

use crate::stream::{self, IoError};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Receive buffer size. Enough for line-rate on gigabit links while
/// staying small.
pub const RECV_CHUNK_SIZE: usize = 2048;

/// Copy buffer for the non-sendfile path.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a single sendfile call.
#[cfg(target_os = "linux")]
const SENDFILE_CHUNK: u64 = 8 * 1024 * 1024;

/// Receiver-side accounting for one file.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    expected_bytes: u32,
    received_bytes: u32,
    started: Instant,
}

impl TransferProgress {
    pub fn new(expected_bytes: u32) -> Self {
        Self {
            expected_bytes,
            received_bytes: 0,
            started: Instant::now(),
        }
    }

    /// Account for `n` more bytes. Never exceeds the expected total.
    pub fn record(&mut self, n: usize) {
        let n = u32::try_from(n).unwrap_or(u32::MAX).min(self.remaining());
        self.received_bytes += n;
    }

    pub fn expected_bytes(&self) -> u32 {
        self.expected_bytes
    }

    pub fn received_bytes(&self) -> u32 {
        self.received_bytes
    }

    pub fn remaining(&self) -> u32 {
        self.expected_bytes - self.received_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.received_bytes == self.expected_bytes
    }

    /// Completion percentage. An empty file is complete at 100.
    pub fn percent(&self) -> u64 {
        if self.expected_bytes == 0 {
            return 100;
        }
        u64::from(self.received_bytes) * 100 / u64::from(self.expected_bytes)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average rate since the transfer started, in MB/s (10^6 bytes).
    pub fn rate_mb_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64().max(1e-4);
        f64::from(self.received_bytes) / secs / 1_000_000.0
    }
}

/// Outcome of removing a partially received file.
#[derive(Debug)]
pub enum Cleanup {
    Removed,
    NotRemoved(io::Error),
}

/// Transfer failures on either side of the connection.
#[derive(Debug)]
pub enum TransferError {
    /// Sender moved fewer bytes than the header announced
    Shortfall {
        sent: u64,
        expected: u64,
        cause: Option<io::Error>,
    },
    /// Local destination could not be created
    Create { path: PathBuf, source: io::Error },
    /// Receive stopped before the announced size was reached
    Incomplete {
        path: PathBuf,
        received: u32,
        expected: u32,
        cause: IoError,
        cleanup: Cleanup,
    },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Shortfall {
                sent,
                expected,
                cause,
            } => {
                write!(f, "sent {} of {} bytes", sent, expected)?;
                if let Some(cause) = cause {
                    write!(f, ": {}", cause)?;
                }
                Ok(())
            }
            TransferError::Create { path, source } => {
                write!(f, "cannot create '{}': {}", path.display(), source)
            }
            TransferError::Incomplete {
                path,
                received,
                expected,
                cause,
                cleanup,
            } => {
                write!(
                    f,
                    "received {} of {} bytes of '{}' ({}), ",
                    received,
                    expected,
                    path.display(),
                    cause
                )?;
                match cleanup {
                    Cleanup::Removed => write!(f, "corrupted file deleted"),
                    Cleanup::NotRemoved(e) => write!(f, "corrupted file not deleted: {}", e),
                }
            }
        }
    }
}

impl std::error::Error for TransferError {}

/// Stream `len` bytes of `file` to `stream`.
///
/// Returns the byte count on success. Anything short of `len` is a
/// [`TransferError::Shortfall`]: either the peer went away or the file
/// shrank after its size was captured.
pub async fn send_file(
    stream: &mut TcpStream,
    file: std::fs::File,
    len: u64,
) -> Result<u64, TransferError> {
    #[cfg(target_os = "linux")]
    let (sent, cause) = {
        let (sent, cause) = sendfile_to_stream(stream, &file, len).await;
        match cause {
            // Filesystem without sendfile support; finish in user space
            Some(e) if sent == 0 && is_sendfile_unsupported(&e) => {
                tracing::debug!(error = %e, "sendfile unsupported, using buffered copy");
                let mut file = tokio::fs::File::from_std(file);
                copy_exact(&mut file, stream, len).await
            }
            cause => (sent, cause),
        }
    };

    #[cfg(not(target_os = "linux"))]
    let (sent, cause) = {
        let mut file = tokio::fs::File::from_std(file);
        copy_exact(&mut file, stream, len).await
    };

    if sent == len {
        Ok(sent)
    } else {
        Err(TransferError::Shortfall {
            sent,
            expected: len,
            cause,
        })
    }
}

/// Kernel-side copy from `file` to the socket.
#[cfg(target_os = "linux")]
async fn sendfile_to_stream(
    stream: &TcpStream,
    file: &std::fs::File,
    len: u64,
) -> (u64, Option<io::Error>) {
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;

    let in_fd = file.as_raw_fd();
    let out_fd = stream.as_raw_fd();
    let mut sent = 0u64;

    while sent < len {
        let count = (len - sent).min(SENDFILE_CHUNK) as usize;
        let result = stream
            .async_io(Interest::WRITABLE, || {
                // SAFETY: both descriptors are owned and open for the
                // duration of the call; a null offset uses the file position.
                let n = unsafe { libc::sendfile(out_fd, in_fd, std::ptr::null_mut(), count) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as u64)
                }
            })
            .await;

        match result {
            // File ended before `len`
            Ok(0) => break,
            Ok(n) => {
                sent += n;
                tracing::trace!(sent, len, "sendfile progress");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (sent, Some(e)),
        }
    }

    (sent, None)
}

#[cfg(target_os = "linux")]
fn is_sendfile_unsupported(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS))
}

/// Copy up to `len` bytes from `reader` to `writer` through a user-space
/// buffer. Returns the count moved and the error that stopped it, if any.
pub async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut sent = 0u64;

    while sent < len {
        let want = (len - sent).min(COPY_CHUNK_SIZE as u64) as usize;
        let n = match reader.read(&mut buf[..want]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (sent, Some(e)),
        };

        match stream::write_exact(writer, &buf[..n]).await {
            Ok(()) => sent += n as u64,
            Err(IoError::Closed { transferred, .. }) => {
                return (
                    sent + transferred as u64,
                    Some(io::ErrorKind::BrokenPipe.into()),
                )
            }
            Err(IoError::Io(e)) => return (sent, Some(e)),
            Err(e) => return (sent, Some(io::Error::new(io::ErrorKind::Other, e.to_string()))),
        }
    }

    (sent, None)
}

/// Receive exactly `expected` bytes from `reader` into a new file at `path`.
///
/// Reads at most [`RECV_CHUNK_SIZE`] bytes at a time and never more than
/// what remains, so the stream is left positioned at the next reply. Each
/// read is bounded by `timeout`. On any failure after the file was created
/// the file is removed, and the error records whether that succeeded.
pub async fn receive_file<R, F>(
    reader: &mut R,
    path: &Path,
    expected: u32,
    timeout: Option<Duration>,
    mut on_progress: F,
) -> Result<TransferProgress, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnMut(&TransferProgress),
{
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|source| TransferError::Create {
            path: path.to_path_buf(),
            source,
        })?;
    let mut writer = BufWriter::new(file);
    let mut progress = TransferProgress::new(expected);
    let mut buf = [0u8; RECV_CHUNK_SIZE];

    let result = async {
        while !progress.is_complete() {
            let want = (progress.remaining() as usize).min(RECV_CHUNK_SIZE);
            let n = stream::read_some(&mut *reader, &mut buf[..want], timeout).await?;
            if n == 0 {
                return Err(IoError::Closed {
                    transferred: progress.received_bytes() as usize,
                    expected: expected as usize,
                });
            }
            writer.write_all(&buf[..n]).await?;
            progress.record(n);
            on_progress(&progress);
        }
        writer.flush().await?;
        Ok::<(), IoError>(())
    }
    .await;

    match result {
        Ok(()) => {
            if expected == 0 {
                on_progress(&progress);
            }
            Ok(progress)
        }
        Err(cause) => {
            drop(writer);
            let cleanup = match tokio::fs::remove_file(path).await {
                Ok(()) => Cleanup::Removed,
                Err(e) => Cleanup::NotRemoved(e),
            };
            Err(TransferError::Incomplete {
                path: path.to_path_buf(),
                received: progress.received_bytes(),
                expected,
                cause,
                cleanup,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_progress_accounting() {
        let mut progress = TransferProgress::new(4096);
        assert_eq!(progress.percent(), 0);
        assert!(!progress.is_complete());

        progress.record(2048);
        assert_eq!(progress.percent(), 50);
        assert_eq!(progress.remaining(), 2048);

        progress.record(2048);
        assert!(progress.is_complete());
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_progress_never_exceeds_expected() {
        let mut progress = TransferProgress::new(10);
        progress.record(25);
        assert_eq!(progress.received_bytes(), 10);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_empty_file_is_complete() {
        let progress = TransferProgress::new(0);
        assert!(progress.is_complete());
        assert_eq!(progress.percent(), 100);
    }

    #[tokio::test]
    async fn test_receive_file_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let mut mock = Builder::new().read(b"hello").read(b" world").build();

        let mut updates = 0;
        let progress = receive_file(&mut mock, &path, 11, None, |_| updates += 1)
            .await
            .unwrap();

        assert_eq!(progress.received_bytes(), 11);
        assert_eq!(progress.percent(), 100);
        assert_eq!(updates, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_receive_file_leaves_next_reply_unread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let mut reader: &[u8] = b"abc+OK\r\n";

        receive_file(&mut reader, &path, 3, None, |_| {})
            .await
            .unwrap();

        assert_eq!(reader, b"+OK\r\n");
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_receive_file_large_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader: &[u8] = &payload;

        let progress = receive_file(&mut reader, &path, payload.len() as u32, None, |_| {})
            .await
            .unwrap();

        assert_eq!(progress.received_bytes() as usize, payload.len());
        assert_eq!(std::fs::read(&path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_receive_file_zero_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        let mut reader: &[u8] = b"";

        let progress = receive_file(&mut reader, &path, 0, None, |_| {})
            .await
            .unwrap();

        assert!(progress.is_complete());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_receive_file_short_stream_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let mut reader: &[u8] = b"only ten b";

        let err = receive_file(&mut reader, &path, 100, None, |_| {})
            .await
            .unwrap_err();

        match err {
            TransferError::Incomplete {
                received,
                expected,
                cause,
                cleanup,
                ..
            } => {
                assert_eq!(received, 10);
                assert_eq!(expected, 100);
                assert!(matches!(cause, IoError::Closed { .. }));
                assert!(matches!(cleanup, Cleanup::Removed));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_file_timeout_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stalled.bin");
        let mut mock = Builder::new()
            .read(b"abc")
            .wait(Duration::from_secs(60))
            .build();

        let err = receive_file(&mut mock, &path, 10, Some(Duration::from_secs(6)), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::Incomplete {
                cause: IoError::Timeout,
                cleanup: Cleanup::Removed,
                ..
            }
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_receive_file_create_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("file");
        let mut reader: &[u8] = b"abc";

        let err = receive_file(&mut reader, &path, 3, None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Create { .. }));
    }

    #[tokio::test]
    async fn test_copy_exact_stops_at_len() {
        let mut reader: &[u8] = b"0123456789";
        let mut out = Vec::new();
        let (sent, cause) = copy_exact(&mut reader, &mut out, 4).await;
        assert_eq!(sent, 4);
        assert!(cause.is_none());
        assert_eq!(out, b"0123");
    }

    #[tokio::test]
    async fn test_copy_exact_reports_short_source() {
        let mut reader: &[u8] = b"0123";
        let mut out = Vec::new();
        let (sent, cause) = copy_exact(&mut reader, &mut out, 10).await;
        assert_eq!(sent, 4);
        assert!(cause.is_none());
    }
}
