use thiserror::Error;

/// Pacer error types covering configuration, contract violations, and OS failures.
///
/// Degraded real-time operation (scheduling or memory locking refused by the
/// OS) is deliberately absent: it is reported as a warning and a status value,
/// never as an error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PacerError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Spinner frequency was zero, negative, or not finite.
    #[error("invalid frequency: {0} Hz (must be finite and > 0)")]
    InvalidFrequency(f64),

    /// An operation was called out of order (spin before arming, double join, ...).
    #[error("invalid call sequence: {0}")]
    Sequence(String),

    /// An OS thread primitive failed.
    #[error("OS error: {0}")]
    Os(String),

    /// The real-time worker terminated abnormally.
    #[error("runtime fault: {0}")]
    Fault(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PacerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience type alias for pacer operations.
pub type PacerResult<T> = Result<T, PacerError>;
