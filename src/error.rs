//! Error types for control sessions and socket setup.
//!
//! Socket and protocol operations return `Result<T, Error>`. Wire decoding
//! failures are reported separately as [`CodecError`] so callers can tell a
//! malformed peer apart from a broken connection.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::ResponseCode;

/// Errors raised while decoding a control frame or validating its contents.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Fewer bytes were available than the frame declared.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A frame with a zero length prefix.
    #[error("empty control frame")]
    EmptyFrame,

    /// The length prefix exceeds the frame limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Unknown discriminant, missing required field or otherwise bad payload.
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A valid message arrived where a different type was required.
    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedType {
        expected: &'static str,
        got: &'static str,
    },

    /// A test-scoped message belongs to another test.
    #[error("test type mismatch: expected {expected}, got {got}")]
    TestTypeMismatch { expected: u64, got: u64 },
}

/// The crate error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested port is taken in at least one address family.
    #[error("address already in use")]
    AddrInUse,

    /// Neither an IPv4 nor an IPv6 socket could be made usable.
    #[error("no sockets available: {0}")]
    NoSockets(&'static str),

    #[error("failed to bind to device {device}: {source}")]
    BindDevice { device: String, source: io::Error },

    #[error("failed to bind to {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    /// Every connect attempt failed.
    #[error("failed to connect to {name} ({addr}) after {attempts} attempts: {source}")]
    ConnectFailed {
        name: String,
        addr: SocketAddr,
        attempts: u32,
        source: io::Error,
    },

    #[error("timed out waiting for a control connection")]
    Timeout,

    /// The peer closed the control session.
    #[error("control connection closed")]
    ConnectionClosed,

    #[error("TLS: {0}")]
    Tls(String),

    /// A socket option was rejected or read back with the wrong value.
    #[error("socket option {option}: {reason}")]
    SocketOption {
        option: &'static str,
        reason: String,
    },

    /// The remote end answered with a non-OK response.
    #[error("remote error {code}: {message}")]
    Remote { code: ResponseCode, message: String },

    /// The peer broke the message sequence or sent an unusable request.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A test module failed to parse, run or print.
    #[error("test module: {0}")]
    Module(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the port should be bumped and retried.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Error::AddrInUse)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
