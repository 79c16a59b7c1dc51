//! Run-level failures.

use stepwise_core::error::ProviderError;
use stepwise_core::message::Transcript;
use thiserror::Error;

use crate::events::ExecutionEvent;

/// Why a run ended in `failed`.
///
/// Tool problems never appear here; they are fed back to the model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("malformed provider response: {0}")]
    ProviderMalformedResponse(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("iteration {iteration} exceeded the {timeout_ms}ms limit")]
    IterationTimeout { iteration: u32, timeout_ms: u64 },
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::ProviderMalformedResponse(_) => "provider_malformed_response",
            Self::Cancelled => "cancelled",
            Self::IterationTimeout { .. } => "iteration_timeout",
        }
    }
}

impl From<ProviderError> for RunError {
    fn from(err: ProviderError) -> Self {
        if err.is_malformed() {
            Self::ProviderMalformedResponse(err.to_string())
        } else {
            Self::ProviderUnavailable(err.to_string())
        }
    }
}

impl From<RunError> for stepwise_core::Error {
    fn from(err: RunError) -> Self {
        Self::Run {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<RunFailure> for stepwise_core::Error {
    fn from(failure: RunFailure) -> Self {
        Self::Run {
            kind: failure.error.kind().to_string(),
            message: failure.to_string(),
        }
    }
}

/// A failed run with whatever it produced before failing.
#[derive(Debug, Error)]
#[error("run {run_id} failed after {iterations} iteration(s): {error}")]
pub struct RunFailure {
    pub run_id: String,

    #[source]
    pub error: RunError,

    /// Transcript up to the failure point
    pub transcript: Transcript,

    pub iterations: u32,

    pub events: Vec<ExecutionEvent>,
}
