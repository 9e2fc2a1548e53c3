//! Candidate continuations proposed by the draft model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::SyncError;
use super::sequence::GroupedId;
use crate::scheduler::RequestId;

/// Proposed token ids and log-probabilities for one sequence.
///
/// Token ids and log-probs are index-aligned; construction rejects
/// mismatched lengths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeneratedSequence")]
pub struct GeneratedSequence {
    token_ids: Vec<u32>,
    log_probs: Vec<f32>,
}

#[derive(Deserialize)]
struct RawGeneratedSequence {
    token_ids: Vec<u32>,
    log_probs: Vec<f32>,
}

impl TryFrom<RawGeneratedSequence> for GeneratedSequence {
    type Error = SyncError;

    fn try_from(raw: RawGeneratedSequence) -> Result<Self, Self::Error> {
        Self::new(raw.token_ids, raw.log_probs)
    }
}

impl GeneratedSequence {
    pub fn new(token_ids: Vec<u32>, log_probs: Vec<f32>) -> Result<Self, SyncError> {
        if token_ids.len() != log_probs.len() {
            return Err(SyncError::LengthMismatch {
                tokens: token_ids.len(),
                log_probs: log_probs.len(),
            });
        }
        Ok(Self { token_ids, log_probs })
    }

    /// Candidate with zero log-probabilities, for callers that do not track them.
    pub fn from_tokens(token_ids: &[u32]) -> Self {
        Self { token_ids: token_ids.to_vec(), log_probs: vec![0.0; token_ids.len()] }
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn log_probs(&self) -> &[f32] {
        &self.log_probs
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

/// Candidates for one request, keyed by grouped id in ascending order.
pub type CandidateSet = BTreeMap<GroupedId, GeneratedSequence>;

/// Candidate sets for every active request, keyed by request id.
pub type GeneratedRequests = BTreeMap<RequestId, CandidateSet>;

/// Outcome of one reconciliation, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateRequestResult {
    /// Tokens rolled back from each reconciled sequence.
    pub removed_tokens: usize,
    /// Tokens appended to each reconciled sequence.
    pub inserted_tokens: usize,
}

impl UpdateRequestResult {
    pub fn new(removed_tokens: usize, inserted_tokens: usize) -> Self {
        Self { removed_tokens, inserted_tokens }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_lengths_rejected() {
        let err = GeneratedSequence::new(vec![1, 2], vec![0.0]).unwrap_err();
        assert!(matches!(err, SyncError::LengthMismatch { tokens: 2, log_probs: 1 }));
    }

    #[test]
    fn deserialization_validates_lengths() {
        let ok: GeneratedSequence =
            serde_json::from_str(r#"{"token_ids":[1,2],"log_probs":[-0.1,-0.2]}"#).unwrap();
        assert_eq!(ok.token_ids(), &[1, 2]);

        let bad = serde_json::from_str::<GeneratedSequence>(
            r#"{"token_ids":[1,2],"log_probs":[-0.1]}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn candidate_set_iterates_in_grouped_order() {
        let mut set = CandidateSet::new();
        set.insert(2, GeneratedSequence::from_tokens(&[9]));
        set.insert(0, GeneratedSequence::from_tokens(&[7, 8]));

        let first = set.iter().next().map(|(id, _)| *id);
        assert_eq!(first, Some(0));
    }

    #[test]
    fn generated_requests_serialize_to_json() {
        let mut set = CandidateSet::new();
        set.insert(0, GeneratedSequence::from_tokens(&[5]));
        let mut requests = GeneratedRequests::new();
        requests.insert(RequestId(11), set);

        let json = serde_json::to_string(&requests).unwrap();
        assert!(json.contains("\"11\""));
        assert!(json.contains("token_ids"));
    }
}
