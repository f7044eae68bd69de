//! Error types for urdma
//!
//! Every variant belongs to one [`ErrorClass`]. Callers use the class to
//! decide how far an error propagates: per-connection classes close one
//! connection, [`ErrorClass::InternalInvariantViolation`] stops the daemon.

use std::net::SocketAddr;

use thiserror::Error;

/// Propagation class of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or out-of-sequence input; fatal to that connection
    ProtocolViolation,
    /// A handshake did not complete in time
    Timeout,
    /// No core or QP left; rejects the request and its connection
    ResourceExhausted,
    /// Socket or channel I/O failed
    TransportError,
    /// Shared state has desynchronized; the daemon must restart
    InternalInvariantViolation,
    /// API misuse by a local caller (bad state, bad argument)
    Usage,
}

/// urdma error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("short message: expected {expected} bytes, got {got}")]
    ShortMessage { expected: usize, got: usize },

    #[error("handshake timed out")]
    Timeout,

    #[error("insufficient cores: requested {requested}, available {available}")]
    InsufficientCores { requested: u32, available: u32 },

    #[error("no queue pair available on device {dev_id}")]
    NoQpAvailable { dev_id: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("address in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("work item already scheduled")]
    AlreadyScheduled,

    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("queue pair {dev_id}/{qp_id} is not owned by the caller")]
    NotOwner { dev_id: u16, qp_id: u16 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    /// Taxonomy class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ProtocolViolation(_)
            | Error::UnknownOpcode(_)
            | Error::ShortMessage { .. } => ErrorClass::ProtocolViolation,
            Error::Timeout => ErrorClass::Timeout,
            Error::InsufficientCores { .. } | Error::NoQpAvailable { .. } => {
                ErrorClass::ResourceExhausted
            }
            Error::Io(_) | Error::Os(_) | Error::PeerClosed | Error::AddressInUse(_) => {
                ErrorClass::TransportError
            }
            Error::InvariantViolation(_) => ErrorClass::InternalInvariantViolation,
            Error::AlreadyScheduled
            | Error::InvalidState { .. }
            | Error::NotOwner { .. }
            | Error::InvalidArgument(_)
            | Error::Config(_) => ErrorClass::Usage,
        }
    }

    /// True if the error must terminate the daemon
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::InternalInvariantViolation
    }
}

/// Result type for urdma operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::InsufficientCores { requested: 8, available: 4 };
        assert_eq!(e.to_string(), "insufficient cores: requested 8, available 4");

        let e = Error::ShortMessage { expected: 8, got: 3 };
        assert_eq!(e.to_string(), "short message: expected 8 bytes, got 3");

        let e = Error::InvalidState { op: "accept", state: "Listening" };
        assert_eq!(e.to_string(), "accept is not valid in state Listening");
    }

    #[test]
    fn test_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
        assert_eq!(e.class(), ErrorClass::TransportError);

        let e: Error = nix::errno::Errno::ECONNRESET.into();
        assert!(matches!(e, Error::Os(nix::errno::Errno::ECONNRESET)));
    }

    #[test]
    fn test_error_class() {
        assert_eq!(Error::protocol("bad key").class(), ErrorClass::ProtocolViolation);
        assert_eq!(Error::UnknownOpcode(99).class(), ErrorClass::ProtocolViolation);
        assert_eq!(Error::Timeout.class(), ErrorClass::Timeout);
        assert_eq!(
            Error::NoQpAvailable { dev_id: 0 }.class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(Error::AlreadyScheduled.class(), ErrorClass::Usage);
    }

    #[test]
    fn test_config_error_wraps() {
        let e: Error = ConfigError::InvalidValue("max_qp must be > 0").into();
        assert_eq!(e.to_string(), "invalid config: max_qp must be > 0");
        assert_eq!(e.class(), ErrorClass::Usage);
    }

    #[test]
    fn test_only_invariant_is_fatal() {
        assert!(Error::invariant("rxq mismatch").is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::PeerClosed.is_fatal());
        assert!(!Error::InsufficientCores { requested: 1, available: 0 }.is_fatal());
    }
}
