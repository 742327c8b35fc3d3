//! Error types for the apogee-adjust library
//!
//! All errors use the `thiserror` crate for automatic trait implementations.
//! The taxonomy follows the way failures propagate through a run: argument
//! errors and data-quality problems are fatal at the top level, per-residual
//! numerical failures are dropped inside the graph builder and never reach
//! this type.

use thiserror::Error;

/// Main result type used throughout the apogee-adjust library
pub type AdjustResult<T> = Result<T, AdjustError>;

/// Main error type for the apogee-adjust library
#[derive(Debug, Clone, Error)]
pub enum AdjustError {
    /// Malformed command line, missing required files, incompatible flags
    #[error("Argument error: {0}")]
    Argument(String),

    /// IO related errors (file loading, parsing, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// Control-network construction and data-quality errors
    #[error("Control network error: {0}")]
    Network(String),

    /// Solver related errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// Invariant violations (e.g. residual count mismatch)
    #[error("Logic error: {0}")]
    Logic(String),
}

impl From<std::io::Error> for AdjustError {
    fn from(err: std::io::Error) -> Self {
        AdjustError::Io(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for AdjustError {
    fn from(err: std::num::ParseFloatError) -> Self {
        AdjustError::Io(format!("Failed to parse float: {err}"))
    }
}

impl From<std::num::ParseIntError> for AdjustError {
    fn from(err: std::num::ParseIntError) -> Self {
        AdjustError::Io(format!("Failed to parse integer: {err}"))
    }
}

impl From<csv::Error> for AdjustError {
    fn from(err: csv::Error) -> Self {
        AdjustError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AdjustError::Argument("missing output prefix".to_string());
        assert_eq!(error.to_string(), "Argument error: missing output prefix");
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error = AdjustError::from(io_error);

        match error {
            AdjustError::Io(msg) => assert!(msg.contains("File not found")),
            _ => panic!("Expected IO error"),
        }
    }
}
