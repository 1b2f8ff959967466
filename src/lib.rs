//! getfile: a minimal binary file transfer protocol
//!
//! A client requests files by name with `GET <name>\r\n`; the server
//! answers with a fixed header (`+OK\r\n`, size, modification time)
//! followed by the raw bytes, or `-ERR\r\n` and a closed connection.
//! `QUIT\r\n` ends a session.
//!
//! Layers, leaf first:
//! - `stream`: exact-count reads and writes with deadlines
//! - `protocol`: command and reply framing
//! - `transfer`: file streaming on both sides
//! - `session`: per-connection server state machine
//! - `server`: listener, accept loop and task reaping
//! - `client`: connect and request driver
//! - `config`: CLI and TOML configuration

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod transfer;
