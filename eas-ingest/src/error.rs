//! Error types for the audio ingest module
//!
//! Back-pressure (overruns/underruns) is deliberately not represented here:
//! it is accounting, surfaced through metrics, never an error. The consumer
//! API is total and reports underflow as `None`.

use thiserror::Error;

/// Main error type for the ingest pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors from pipe and file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration (duplicate name, non-positive timeout, ...).
    /// Surfaced at construction; never recovered.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ring buffer capacity outside the accepted range
    #[error("Invalid ring capacity {requested} (must be 1..={max} samples)")]
    InvalidCapacity { requested: usize, max: usize },

    /// Decoder subprocess could not be created
    #[error("Failed to spawn decoder for source '{source_name}': {reason}")]
    Spawn { source_name: String, reason: String },

    /// Transient I/O failure on the decoder subprocess pipe
    #[error("Decoder read failed for source '{source_name}': {reason}")]
    Read { source_name: String, reason: String },

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Spawn {
            source_name: "primary".to_string(),
            reason: "No such file or directory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("primary"));
        assert!(msg.contains("No such file"));

        let err = Error::InvalidCapacity {
            requested: 0,
            max: 1 << 24,
        };
        assert!(err.to_string().contains('0'));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
