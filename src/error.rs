//! Error types for proxion.
//!
//! Only input validation and store I/O are errors. A probe that fails is an
//! ordinary [`ProbeOutcome::Failure`](crate::proxy::ProbeOutcome) value.

use std::fmt;

/// A specialized Result type for proxion operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised before any network activity starts, or by the record store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid proxy format: {0:?} (expected IPv4:port)")]
    InvalidFormat(String),

    #[error("can not update proxy {expected} with a record for {found}")]
    MismatchedEndpoint { expected: String, found: String },

    #[error("unknown protocol requested: {0:?}")]
    UnknownProtocol(String),

    #[error("no protocols requested")]
    NoProtocolsRequested,

    #[error("invalid duration: {0:?} (use a suffix of s, m, h, d, w, mo, y)")]
    InvalidDuration(String),

    #[error("invalid exit country: {0:?} (expected two letters, e.g. US)")]
    InvalidCountry(String),

    #[error("invalid concurrency: {0} (must be at least 1)")]
    InvalidConcurrency(usize),

    #[error("no tasks to run")]
    NoTasks,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new invalid format error.
    pub fn invalid_format(input: impl fmt::Display) -> Self {
        Error::InvalidFormat(input.to_string())
    }

    /// Whether the error was raised by input validation.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::Serialization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::invalid_format("1.2.3:80");
        assert_eq!(
            err.to_string(),
            "invalid proxy format: \"1.2.3:80\" (expected IPv4:port)"
        );
        assert_eq!(
            Error::InvalidConcurrency(0).to_string(),
            "invalid concurrency: 0 (must be at least 1)"
        );
    }

    #[test]
    fn test_is_validation() {
        assert!(Error::NoTasks.is_validation());
        assert!(Error::InvalidDuration("10x".into()).is_validation());
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!io.is_validation());
    }
}
