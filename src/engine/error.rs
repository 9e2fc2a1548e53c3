//! Error types for the speculative synchronization core.
//!
//! Precondition violations are fail-closed: the call aborts and nothing is
//! swallowed. Absent entities and exhausted budgets are not errors.

use thiserror::Error;

use crate::engine::sequence::GroupedId;
use crate::scheduler::RequestId;

/// Errors that can occur while reconciling or driving draft requests.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Rollback needs {required} generated tokens, sequence has {generated}")]
    RollbackBeyondLength { generated: usize, required: usize },

    #[error("Sequence already holds {generated} tokens, candidate only {candidate}")]
    InsertBeyondCandidate { generated: usize, candidate: usize },

    #[error("Request {request_id:?} has two sequences with grouped id {grouped_id}")]
    DuplicateGroupedId { request_id: RequestId, grouped_id: GroupedId },

    #[error("Request {0:?} has no speculative decoding parameters")]
    NotSpeculative(RequestId),

    #[error("Request {0:?} has no running sequences")]
    NoRunningSequences(RequestId),

    #[error("No logit processor registered for request {0:?}")]
    MissingLogitProcessor(RequestId),

    #[error("Token ids ({tokens}) and log-probs ({log_probs}) differ in length")]
    LengthMismatch { tokens: usize, log_probs: usize },

    #[error("Invalid sampling parameters: {0}")]
    InvalidParams(String),

    #[error("Request {0:?} is already admitted")]
    DuplicateRequest(RequestId),

    #[error("Draft step failed: {0}")]
    DraftStep(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true if this error indicates a caller or integration defect.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Self::RollbackBeyondLength { .. }
                | Self::InsertBeyondCandidate { .. }
                | Self::DuplicateGroupedId { .. }
                | Self::NotSpeculative(_)
                | Self::NoRunningSequences(_)
                | Self::MissingLogitProcessor(_)
                | Self::LengthMismatch { .. }
        )
    }

    /// Returns true if this error was raised while admitting a request.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, Self::InvalidParams(_) | Self::DuplicateRequest(_))
    }
}
