//! Wire format for the line-oriented file transfer protocol.
//!
//! ```text
//! Client -> Server:  <path>\n
//! Server -> Client:  OK <length>\n<bytes>          (status mode, success)
//!                    ERR <kind> <message>\n        (status mode, failure)
//!                    <bytes>                       (raw mode)
//! ```
//!
//! In raw mode every failure is signaled by closing the connection
//! without writing anything, so an empty file and a rejected request are
//! indistinguishable to the client.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::error::{Result, TransferError};

/// Upper bound for a status line sent by the server.
pub const MAX_STATUS_LINE: usize = 512;

/// How the server frames its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// One status line precedes the body.
    #[default]
    Status,
    /// Body only, failures close the connection silently.
    Raw,
}

/// Failure categories carried by an `ERR` status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    AccessDenied,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AccessDenied => "access_denied",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        match name {
            "invalid_request" => Some(ErrorKind::InvalidRequest),
            "not_found" => Some(ErrorKind::NotFound),
            "access_denied" => Some(ErrorKind::AccessDenied),
            _ => None,
        }
    }
}

/// Parsed status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Ok { length: u64 },
    Err { kind: ErrorKind, message: String },
}

impl StatusLine {
    /// Encode the status line including the trailing newline.
    pub fn encode(&self) -> Bytes {
        match self {
            StatusLine::Ok { length } => Bytes::from(format!("OK {length}\n")),
            StatusLine::Err { kind, message } => {
                // Messages must stay on one line.
                let message: String = message
                    .chars()
                    .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                    .collect();
                Bytes::from(format!("ERR {} {}\n", kind.as_str(), message))
            }
        }
    }
}

/// Result of scanning a buffer for a newline-terminated line.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<T> {
    /// Line parsed; the second field is the number of bytes consumed,
    /// including the newline.
    Complete(T, usize),
    /// No newline yet and the bound has not been reached.
    Incomplete,
    /// No newline within the allowed length.
    TooLong,
    /// Line is complete but its contents are unacceptable.
    Invalid(String),
}

/// Parse a request line into the requested path.
///
/// A trailing `\r` is tolerated. `max_len` bounds the line without its
/// newline.
pub fn parse_request_line(input: &[u8], max_len: usize) -> ParseResult<String> {
    let line_end = match find_line_end(input, max_len) {
        Ok(Some(pos)) => pos,
        Ok(None) => return ParseResult::Incomplete,
        Err(()) => return ParseResult::TooLong,
    };

    let line = strip_cr(&input[..line_end]);

    if line.is_empty() {
        return ParseResult::Invalid("empty path".to_string());
    }
    if line.contains(&0) {
        return ParseResult::Invalid("path contains NUL byte".to_string());
    }

    match std::str::from_utf8(line) {
        Ok(path) => ParseResult::Complete(path.to_string(), line_end + 1),
        Err(_) => ParseResult::Invalid("path is not valid UTF-8".to_string()),
    }
}

/// Parse a server status line.
pub fn parse_status_line(input: &[u8], max_len: usize) -> ParseResult<StatusLine> {
    let line_end = match find_line_end(input, max_len) {
        Ok(Some(pos)) => pos,
        Ok(None) => return ParseResult::Incomplete,
        Err(()) => return ParseResult::TooLong,
    };

    let line = match std::str::from_utf8(strip_cr(&input[..line_end])) {
        Ok(s) => s,
        Err(_) => return ParseResult::Invalid("status line is not valid UTF-8".to_string()),
    };
    let consumed = line_end + 1;

    if let Some(length) = line.strip_prefix("OK ") {
        return match length.trim().parse::<u64>() {
            Ok(length) => ParseResult::Complete(StatusLine::Ok { length }, consumed),
            Err(_) => ParseResult::Invalid(format!("invalid length '{length}'")),
        };
    }

    if let Some(rest) = line.strip_prefix("ERR ") {
        let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
        return match ErrorKind::from_wire(name) {
            Some(kind) => ParseResult::Complete(
                StatusLine::Err {
                    kind,
                    message: message.to_string(),
                },
                consumed,
            ),
            None => ParseResult::Invalid(format!("unknown error kind '{name}'")),
        };
    }

    ParseResult::Invalid(format!("unrecognized status line '{line}'"))
}

/// Encode a request line for `path`.
pub fn encode_request(path: &str) -> Result<Bytes> {
    if path.is_empty() {
        return Err(TransferError::InvalidRequest("empty path".to_string()));
    }
    if path.contains(['\n', '\r']) {
        return Err(TransferError::InvalidRequest(
            "path contains a line break".to_string(),
        ));
    }

    let mut buf = BytesMut::with_capacity(path.len() + 1);
    buf.put_slice(path.as_bytes());
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// Position of the first `\n` within the bound.
///
/// `Err(())` when the buffer already holds more than `max_len` bytes
/// without a newline.
fn find_line_end(input: &[u8], max_len: usize) -> std::result::Result<Option<usize>, ()> {
    let window = &input[..input.len().min(max_len.saturating_add(1))];
    match window.iter().position(|&b| b == b'\n') {
        Some(pos) => Ok(Some(pos)),
        None if input.len() > max_len => Err(()),
        None => Ok(None),
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
