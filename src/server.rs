//! TCP server for the file transfer protocol.
//!
//! Binds one dual-stack listener, accepts connections indefinitely and
//! hands each one to its own task. Finished tasks are reaped as they
//! complete so outcomes are logged and panics never go unnoticed; the
//! accept loop itself never waits on a connection's lifetime.

use crate::config::ServerConfig;
use crate::session::Session;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: ServerConfig,
    root: Arc<PathBuf>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let root = Arc::new(config.root.clone());
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            root,
            connection_limit,
        }
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::from_std(bind_listener(self.config.host, self.config.port)?)?;
        info!(address = %listener.local_addr()?, root = %self.root.display(), "Server listening");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Connections still running at shutdown are aborted.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut next_id: u64 = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                Some(done) = workers.join_next() => reap(done),

                accepted = accept_with_permit(&listener, &self.connection_limit) => {
                    let (stream, addr, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    next_id += 1;
                    let peer = peer_display(addr);
                    let span = info_span!("conn", id = next_id, pid = std::process::id(), peer = %peer);
                    debug!(parent: &span, "New connection");

                    let session = Session::new(stream, Arc::clone(&self.root), self.config.idle_timeout);
                    workers.spawn(
                        async move {
                            let end = session.run().await;
                            debug!(outcome = %end, "Connection closed");
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
            }
        }

        drop(listener);
        if !workers.is_empty() {
            info!(active = workers.len(), "Shutting down, aborting open connections");
        }
        workers.shutdown().await;
        Ok(())
    }
}

/// Wait for a connection slot, then accept.
async fn accept_with_permit(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
) -> io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let permit = Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let (stream, addr) = listener.accept().await?;
    Ok((stream, addr, permit))
}

/// Collect one finished connection task. Normal outcomes were already
/// logged inside the connection span.
fn reap(done: Result<(), JoinError>) {
    match done {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "Connection task panicked"),
        Err(e) => debug!(error = %e, "Connection task cancelled"),
    }
}

/// Create the listening socket.
///
/// With no explicit host this is an IPv6 socket on `[::]` with
/// `IPV6_V6ONLY` off, so IPv4 peers arrive as mapped addresses. Hosts
/// without IPv6 fall back to `0.0.0.0`.
pub fn bind_listener(host: Option<IpAddr>, port: u16) -> io::Result<std::net::TcpListener> {
    match host {
        Some(ip) => bind_socket(SocketAddr::new(ip, port)),
        None => match bind_socket(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)) {
            Ok(listener) => Ok(listener),
            Err(e) => {
                warn!(error = %e, "IPv6 listener unavailable, falling back to IPv4");
                bind_socket(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
            }
        },
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Peer address for logs, with IPv4-mapped IPv6 shown as plain IPv4.
pub fn peer_display(addr: SocketAddr) -> String {
    SocketAddr::new(addr.ip().to_canonical(), addr.port()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn test_config(root: PathBuf) -> ServerConfig {
        ServerConfig {
            host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 0,
            root,
            idle_timeout: Duration::from_secs(5),
            max_connections: 16,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_peer_display() {
        let mapped: SocketAddr = "[::ffff:192.0.2.7]:4000".parse().unwrap();
        assert_eq!(peer_display(mapped), "192.0.2.7:4000");

        let v6: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(peer_display(v6), "[2001:db8::1]:4000");

        let v4: SocketAddr = "10.0.0.1:22".parse().unwrap();
        assert_eq!(peer_display(v4), "10.0.0.1:22");
    }

    #[tokio::test]
    async fn test_reap_contains_failed_tasks() {
        let panicked = tokio::spawn(async { panic!("session bug") }).await;
        assert!(panicked.as_ref().unwrap_err().is_panic());
        reap(panicked);

        let pending = tokio::spawn(std::future::pending::<()>());
        pending.abort();
        let cancelled = pending.await;
        assert!(cancelled.as_ref().unwrap_err().is_cancelled());
        reap(cancelled);

        reap(Ok(()));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind_listener(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), 0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_dual_stack_accepts_ipv4() {
        // Skipped silently on hosts without IPv6
        let Ok(listener) = bind_socket(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)) else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let listener = TcpListener::from_std(listener).unwrap();

        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let (_stream, addr) = listener.accept().await.unwrap();
        assert_eq!(peer_display(addr), client.local_addr().unwrap().to_string());
    }

    #[tokio::test]
    async fn test_serves_concurrent_clients() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let server = Arc::new(Server::new(test_config(dir.path().to_path_buf())));
        let listener = TcpListener::from_std(bind_listener(Some(Ipv4Addr::LOCALHOST.into()), 0).unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .serve(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        // An idle connection must not hold up anyone else
        let _idle = TcpStream::connect(addr).await.unwrap();

        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"GET a.txt\r\nQUIT\r\n").await.unwrap();
            let mut reply = Vec::new();
            client.read_to_end(&mut reply).await.unwrap();
            assert_eq!(&reply[..9], b"+OK\r\n\0\0\0\x05");
            assert_eq!(&reply[13..], b"alpha");
        }

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_client_does_not_stop_server() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let server = Arc::new(Server::new(test_config(dir.path().to_path_buf())));
        let listener = TcpListener::from_std(bind_listener(Some(Ipv4Addr::LOCALHOST.into()), 0).unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .serve(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"PUT ").await.unwrap();
        let mut reply = Vec::new();
        bad.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"-ERR\r\n");

        let mut good = TcpStream::connect(addr).await.unwrap();
        good.write_all(b"GET a.txt\r\nQUIT\r\n").await.unwrap();
        let mut reply = Vec::new();
        good.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply[13..], b"alpha");

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
