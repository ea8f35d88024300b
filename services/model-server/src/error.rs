//! Error types for model-server.

use thiserror::Error;

use crate::archive::LoadError;
use crate::predictor::PredictError;

/// Failure while running a submitted prediction. Never retried.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The predictor itself rejected the input
    #[error("prediction failed: {0}")]
    Predict(#[from] PredictError),

    #[error("predictor panicked: {0}")]
    Panicked(String),

    /// A batch call returned a different number of results than inputs
    #[error("batch of {expected} inputs produced {got} results")]
    ShapeMismatch { expected: usize, got: usize },

    /// A worker process died or its pipe broke mid-call
    #[error("worker {index} (pid {pid:?}) lost: {reason}")]
    WorkerLost { index: usize, pid: Option<u32>, reason: String },

    /// A worker reply line could not be decoded
    #[error("undecodable worker reply: {0}")]
    Protocol(String),

    /// A worker answered a single request with a batch or vice versa
    #[error("worker reply does not match the request shape")]
    UnexpectedReply,

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("prediction task failed: {0}")]
    Join(String),
}

impl ExecutionError {
    /// True when the worker that produced this error can no longer be trusted
    /// with another request.
    pub fn is_worker_fault(&self) -> bool {
        match self {
            Self::WorkerLost { .. } | Self::Protocol(_) => true,
            Self::Predict(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// model-server error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid model setup, e.g. a duplicated model name
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No model registered under this name
    #[error("model {0:?} not found")]
    NotFound(String),

    /// Request body is not JSON
    #[error("malformed JSON body: {0}")]
    MalformedBody(String),

    /// Request body is JSON of the wrong shape
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl Error {
    pub fn duplicate(name: &str) -> Self {
        Self::Configuration(format!("duplicated model name {name:?}"))
    }
}

/// Result type alias for model-server operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_faults() {
        let lost = ExecutionError::WorkerLost { index: 0, pid: Some(7), reason: "eof".into() };
        assert!(lost.is_worker_fault());
        assert!(ExecutionError::Protocol("garbage".into()).is_worker_fault());
        assert!(ExecutionError::Predict(PredictError::fatal("bridge exited")).is_worker_fault());
        assert!(!ExecutionError::Predict(PredictError::new("bad input")).is_worker_fault());
        assert!(!ExecutionError::PoolClosed.is_worker_fault());
    }
}
