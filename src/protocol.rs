//! Wire codec for the GET/QUIT file transfer protocol.
//!
//! Frames (all integers in network byte order):
//! - Client → server: `GET <filename>\r\n`, `QUIT\r\n`
//! - Server → client: `+OK\r\n` + size:u32 + mtime:u32 + `size` bytes,
//!   or `-ERR\r\n` followed by connection close.
//!
//! Nothing here performs I/O; the session and client drive the stream and
//! hand the framed bytes to these functions.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::str;

/// Prefix of a file request.
pub const GET_PREFIX: &[u8; 4] = b"GET ";

/// Prefix of the session terminator.
pub const QUIT_TOKEN: &[u8; 4] = b"QUIT";

/// Line terminator.
pub const CRLF: &[u8; 2] = b"\r\n";

/// Complete session terminator sent by the client.
pub const QUIT_COMMAND: &[u8; 6] = b"QUIT\r\n";

/// Positive reply prefix.
pub const OK_REPLY: &[u8; 5] = b"+OK\r\n";

/// Error reply. Always followed by connection close.
pub const ERR_REPLY: &[u8; 6] = b"-ERR\r\n";

/// Bytes of a reply the client reads before it can tell `+OK` from `-ERR`.
pub const REPLY_PREFIX_LEN: usize = 5;

/// Size and timestamp fields after `+OK\r\n`.
pub const HEADER_FIELDS_LEN: usize = 8;

/// Longest filename accepted in a `GET` line.
pub const MAX_FILENAME_LEN: usize = 255;

/// Longest `GET` line after the prefix, CRLF included.
pub const MAX_LINE_LEN: usize = MAX_FILENAME_LEN + CRLF.len();

/// Classification of the first four bytes of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Get,
    Quit,
    Unknown([u8; 4]),
}

impl Prefix {
    pub fn classify(bytes: &[u8; 4]) -> Self {
        match bytes {
            b if b == GET_PREFIX => Prefix::Get,
            b if b == QUIT_TOKEN => Prefix::Quit,
            other => Prefix::Unknown(*other),
        }
    }
}

/// One parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Request a file by name, relative to the served directory
    Get { filename: String },
    /// End the session
    Quit,
    /// Anything that does not frame as one of the above
    Malformed(ParseError),
}

/// Framing errors. Every one of these is fatal to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Four-byte prefix is neither `GET ` nor `QUIT`
    UnknownCommand([u8; 4]),
    /// Line does not end in CRLF
    MissingTerminator,
    /// Filename is empty
    EmptyFilename,
    /// Filename exceeds [`MAX_FILENAME_LEN`]
    FilenameTooLong(usize),
    /// Filename is not valid UTF-8
    InvalidUtf8,
    /// Filename contains a line terminator
    ControlCharacter,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnknownCommand(prefix) => {
                write!(f, "Unknown command: {:?}", String::from_utf8_lossy(prefix))
            }
            ParseError::MissingTerminator => write!(f, "Missing CRLF terminator"),
            ParseError::EmptyFilename => write!(f, "Empty filename"),
            ParseError::FilenameTooLong(len) => {
                write!(f, "Filename too long: {} bytes (max {})", len, MAX_FILENAME_LEN)
            }
            ParseError::InvalidUtf8 => write!(f, "Invalid UTF-8 in filename"),
            ParseError::ControlCharacter => write!(f, "Line terminator in filename"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse the remainder of a `GET` line (everything after `GET `).
///
/// `line` must include its terminator; the trailing CRLF is stripped.
pub fn parse_filename(line: &[u8]) -> Result<String, ParseError> {
    let name = line.strip_suffix(CRLF).ok_or(ParseError::MissingTerminator)?;

    if name.is_empty() {
        return Err(ParseError::EmptyFilename);
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(ParseError::FilenameTooLong(name.len()));
    }
    if name.iter().any(|&b| b == b'\r' || b == b'\n') {
        return Err(ParseError::ControlCharacter);
    }

    str::from_utf8(name)
        .map(str::to_string)
        .map_err(|_| ParseError::InvalidUtf8)
}

/// Whether `filename` could resolve outside the served directory.
///
/// Any `../` component is refused outright. Absolute names and a trailing
/// `..` component are refused too, since joining them to the root escapes it.
pub fn escapes_root(filename: &str) -> bool {
    filename.contains("../")
        || filename.starts_with('/')
        || filename == ".."
        || filename.ends_with("/..")
}

/// Encode `GET <filename>\r\n`.
pub fn encode_get(filename: &str) -> Result<BytesMut, ParseError> {
    if filename.is_empty() {
        return Err(ParseError::EmptyFilename);
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(ParseError::FilenameTooLong(filename.len()));
    }
    if filename.contains(['\r', '\n']) {
        return Err(ParseError::ControlCharacter);
    }

    let mut buf = BytesMut::with_capacity(GET_PREFIX.len() + filename.len() + CRLF.len());
    buf.put_slice(GET_PREFIX);
    buf.put_slice(filename.as_bytes());
    buf.put_slice(CRLF);
    Ok(buf)
}

/// Size and modification time announced in a positive reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// File length in bytes
    pub size: u32,
    /// Last modification, Unix seconds
    pub modified_at: u32,
}

impl FileMetadata {
    /// Encode `+OK\r\n` followed by both fields in network byte order.
    pub fn encode_reply(&self) -> [u8; REPLY_PREFIX_LEN + HEADER_FIELDS_LEN] {
        let mut out = [0u8; REPLY_PREFIX_LEN + HEADER_FIELDS_LEN];
        out[..REPLY_PREFIX_LEN].copy_from_slice(OK_REPLY);
        out[REPLY_PREFIX_LEN..REPLY_PREFIX_LEN + 4].copy_from_slice(&self.size.to_be_bytes());
        out[REPLY_PREFIX_LEN + 4..].copy_from_slice(&self.modified_at.to_be_bytes());
        out
    }

    /// Decode the eight bytes that follow `+OK\r\n`.
    pub fn decode_fields(fields: &[u8; HEADER_FIELDS_LEN]) -> Self {
        let [s0, s1, s2, s3, t0, t1, t2, t3] = *fields;
        FileMetadata {
            size: u32::from_be_bytes([s0, s1, s2, s3]),
            modified_at: u32::from_be_bytes([t0, t1, t2, t3]),
        }
    }
}

/// What the first five reply bytes announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPrefix {
    /// `+OK\r\n`; the header fields follow
    Ok,
    /// `-ERR\r`; one more byte must be `\n`
    Err,
    /// Anything else
    Invalid([u8; REPLY_PREFIX_LEN]),
}

impl ReplyPrefix {
    pub fn classify(bytes: &[u8; REPLY_PREFIX_LEN]) -> Self {
        if bytes == OK_REPLY {
            ReplyPrefix::Ok
        } else if bytes[..] == ERR_REPLY[..REPLY_PREFIX_LEN] {
            ReplyPrefix::Err
        } else {
            ReplyPrefix::Invalid(*bytes)
        }
    }

    /// Whether `byte` completes an `-ERR` reply.
    pub fn completes_err(byte: u8) -> bool {
        byte == ERR_REPLY[REPLY_PREFIX_LEN]
    }
}
