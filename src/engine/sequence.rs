//! Sequence tracking for one candidate continuation of a request.
//!
//! A sequence owns the generated token ids and their log-probabilities.
//! The two buffers are index-aligned and always the same length.

use super::error::SyncError;

/// Identity of a sequence within its request.
pub type GroupedId = u64;

/// Process-unique sequence identifier, used for KV-cache association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(pub u64);

/// Reason a sequence stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence or stop token produced.
    Stop,
    /// Generation budget exhausted.
    Length,
}

/// Lifecycle status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Running,
    Finished(FinishReason),
    /// Dropped by the request owner before finishing.
    Dropped,
}

impl SequenceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Finished(FinishReason::Stop) => "FinishedStop",
            Self::Finished(FinishReason::Length) => "FinishedLength",
            Self::Dropped => "Dropped",
        }
    }
}

/// Generated tokens for one continuation.
///
/// # Example
///
/// ```
/// use specsync_core::engine::{Sequence, SequenceId};
///
/// let mut seq = Sequence::new(SequenceId(1), 0);
/// seq.append_token(42, -0.5);
/// seq.append_token(43, -1.25);
/// assert_eq!(seq.generated_len(), 2);
///
/// seq.remove_last_tokens(1).unwrap();
/// assert_eq!(seq.generated_ids(), &[42]);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    id: SequenceId,
    grouped_id: GroupedId,
    generated_ids: Vec<u32>,
    generated_log_probs: Vec<f32>,
    status: SequenceStatus,
}

impl Sequence {
    /// Create an empty running sequence.
    pub fn new(id: SequenceId, grouped_id: GroupedId) -> Self {
        Self {
            id,
            grouped_id,
            generated_ids: Vec::new(),
            generated_log_probs: Vec::new(),
            status: SequenceStatus::Running,
        }
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn grouped_id(&self) -> GroupedId {
        self.grouped_id
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn generated_ids(&self) -> &[u32] {
        &self.generated_ids
    }

    pub fn generated_log_probs(&self) -> &[f32] {
        &self.generated_log_probs
    }

    pub fn generated_len(&self) -> usize {
        self.generated_ids.len()
    }

    /// Cumulative log-probability of the generated continuation.
    pub fn cumulative_log_prob(&self) -> f32 {
        self.generated_log_probs.iter().sum()
    }

    pub fn last_token_id(&self) -> Option<u32> {
        self.generated_ids.last().copied()
    }

    /// Append one generated token with its log-probability.
    pub fn append_token(&mut self, token_id: u32, log_prob: f32) {
        self.generated_ids.push(token_id);
        self.generated_log_probs.push(log_prob);
    }

    /// Drop the trailing `count` tokens.
    ///
    /// # Errors
    ///
    /// Returns error if `count` exceeds the generated length.
    pub fn remove_last_tokens(&mut self, count: usize) -> Result<(), SyncError> {
        let generated = self.generated_len();
        if count > generated {
            return Err(SyncError::RollbackBeyondLength { generated, required: count });
        }
        self.truncate(generated - count);
        Ok(())
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.generated_ids.truncate(len);
        self.generated_log_probs.truncate(len);
    }

    pub fn set_status(&mut self, status: SequenceStatus) {
        self.status = status;
    }

    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished(reason);
    }

    pub fn set_dropped(&mut self) {
        self.status = SequenceStatus::Dropped;
    }
}
