//! Error handling for the P2P session engine.
//!
//! `P2pError` covers both the codec-level failures (malformed control-socket
//! lines, missing attributes) and the request-level outcomes the facade
//! reports to the service layer. Success is expressed as `Ok(())`; there is
//! no dedicated "none" variant.

use thiserror::Error;

/// Result type for P2P operations
pub type Result<T> = std::result::Result<T, P2pError>;

/// Errors that can occur while driving a P2P session
#[derive(Error, Debug)]
pub enum P2pError {
    /// I/O error (control socket, config files, process spawn)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// D-Bus error (firmware loader)
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    /// A control-socket line that does not decode to a message
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A message lacked an expected attribute or positional token
    #[error("missing field: {0}")]
    MissingField(String),

    /// Service disabled or supplicant not connected
    #[error("not ready")]
    NotReady,

    /// A current peer or scan is already in progress
    #[error("already in progress")]
    Already,

    /// Unknown device or invalid argument
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    /// The supplicant refused the request, a socket operation failed, or a
    /// state transition landed in failure
    #[error("operation failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = P2pError::MissingField("p2p_dev_addr".to_string());
        assert_eq!(error.to_string(), "missing field: p2p_dev_addr");

        let error = P2pError::NotReady;
        assert_eq!(error.to_string(), "not ready");

        let error = P2pError::Failed("supplicant refused".to_string());
        assert_eq!(error.to_string(), "operation failed: supplicant refused");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "no such socket");
        let error: P2pError = io_error.into();

        assert!(matches!(error, P2pError::Io(_)));
        assert!(error.to_string().contains("no such socket"));
    }
}
