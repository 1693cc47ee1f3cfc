use crate::source::SourceError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `pulse-analytics`.
///
/// Only [`EngineError::InvalidKey`] and [`EngineError::CoalescingTimeout`] surface to callers as
/// hard failures. [`EngineError::SourceUnavailable`] is recovered inside the
/// [`AnalysisEngine`](crate::engine::AnalysisEngine) by returning a low-confidence fallback
/// result, unless the caller forced a refresh and no fresh data could be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Error)]
pub enum EngineError {
    #[error("invalid MetricKey: {0}")]
    InvalidKey(String),

    #[error("timed out after {waited_ms}ms waiting on in-flight analysis for: {key}")]
    CoalescingTimeout { key: String, waited_ms: u64 },

    #[error("sample source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("analysis task aborted before producing a result for: {0}")]
    ComputationAborted(String),
}

impl EngineError {
    /// Determine if an error must be surfaced to the caller as a hard failure rather than
    /// degraded into a low-confidence fallback result.
    pub fn is_hard(&self) -> bool {
        match self {
            EngineError::InvalidKey(_) => true,
            EngineError::CoalescingTimeout { .. } => true,
            EngineError::SourceUnavailable(_) => false,
            EngineError::ComputationAborted(_) => false,
        }
    }
}

impl From<SourceError> for EngineError {
    fn from(value: SourceError) -> Self {
        Self::SourceUnavailable(value.to_string())
    }
}
