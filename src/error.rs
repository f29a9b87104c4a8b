//! Error types for siltdb.

use std::io;
use thiserror::Error;

/// Result type alias for siltdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the storage engine.
///
/// Errors are plain values; nothing in this crate panics or unwinds on a
/// bad file. Each variant carries a message describing what was observed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored data failed validation (checksum, magic, framing).
    #[error("corruption: {0}")]
    Corruption(String),

    /// Operation or format feature is not supported by this build.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Caller-supplied argument or configuration is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error from the underlying file system.
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a corruption error with secondary context.
    pub fn corruption2<S: Into<String>, T: AsRef<str>>(msg: S, detail: T) -> Self {
        Error::Corruption(join(msg.into(), detail.as_ref()))
    }

    /// Create a not-supported error.
    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an invalid-argument error with secondary context.
    pub fn invalid_argument2<S: Into<String>, T: AsRef<str>>(msg: S, detail: T) -> Self {
        Error::InvalidArgument(join(msg.into(), detail.as_ref()))
    }

    /// Check if this error is a not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

fn join(msg: String, detail: &str) -> String {
    let mut s = msg;
    s.push_str(": ");
    s.push_str(detail);
    s
}
