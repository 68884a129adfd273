//! Error types for the distributed training runtime.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the training coordinator and the workers.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Configuration violation detected at bootstrap.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Protocol violation (unexpected reply kind, count mismatch, ...).
    #[error("internal error: {message}")]
    Internal { message: String },

    /// A worker signaled it has lost its state. Recoverable by rewinding
    /// to the last committed checkpoint.
    #[error("data loss: {message}")]
    DataLoss { message: String },

    /// Model load/save failure.
    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },

    /// Filesystem error.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding of a persisted or transported payload failed.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn data_loss(message: impl Into<String>) -> Self {
        Self::DataLoss {
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// True for errors the training loop recovers from by rewinding to the
    /// last snapshot.
    pub fn is_data_loss(&self) -> bool {
        matches!(self, Self::DataLoss { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_loss_predicate() {
        assert!(TrainError::data_loss("worker restarted").is_data_loss());
        assert!(!TrainError::internal("bad reply").is_data_loss());
    }

    #[test]
    fn test_error_display() {
        let err = TrainError::invalid_argument("cache_path is empty");
        assert_eq!(err.to_string(), "invalid argument: cache_path is empty");
    }
}
