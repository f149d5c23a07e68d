use std::io;
use thiserror::Error;

/// Custom error types for the NFC controller interface
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A read needed more bytes than the packet had left
    #[error("Truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persisted configuration error: {0}")]
    Persist(#[from] bincode::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new truncation error
    pub fn truncated(needed: usize, remaining: usize) -> Self {
        Error::Truncated { needed, remaining }
    }

    /// Creates a new malformed packet error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// True for errors caused by the packet contents rather than the stack
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Truncated { .. } | Error::Malformed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::protocol("test error");
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: test error");
    }

    #[test]
    fn test_truncated_message() {
        let err = Error::truncated(4, 1);
        assert_eq!(err.to_string(), "Truncated packet: needed 4 bytes, 1 remaining");
        assert!(err.is_malformed());
        assert!(!Error::config("x").is_malformed());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
