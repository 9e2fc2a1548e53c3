//! Request (sequence group) state.
//!
//! A request owns its sequences by value. Everything outside the request
//! refers to them by grouped id or sequence id, never by reference.

use serde::{Deserialize, Serialize};

use crate::engine::params::SamplingParams;
use crate::engine::sequence::{GroupedId, Sequence, SequenceId};

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// One user generation request and its candidate continuations.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    prompt_ids: Vec<u32>,
    params: SamplingParams,
    sequences: Vec<Sequence>,
    num_processed_tokens: usize,
    paused: bool,
    num_validated_tokens: usize,
}

impl Request {
    /// Create a request holding one empty running sequence (grouped id 0).
    pub fn new(
        id: RequestId,
        prompt_ids: Vec<u32>,
        params: SamplingParams,
        first_sequence: SequenceId,
    ) -> Self {
        Self {
            id,
            prompt_ids,
            params,
            sequences: vec![Sequence::new(first_sequence, 0)],
            num_processed_tokens: 0,
            paused: false,
            num_validated_tokens: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn is_speculative(&self) -> bool {
        self.params.is_speculative_decoding()
    }

    /// All sequences, in creation order, whatever their status.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|s| s.is_running())
    }

    pub fn running_sequences_mut(&mut self) -> impl Iterator<Item = &mut Sequence> {
        self.sequences.iter_mut().filter(|s| s.is_running())
    }

    pub fn num_running_sequences(&self) -> usize {
        self.running_sequences().count()
    }

    pub fn sequence(&self, grouped_id: GroupedId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.grouped_id() == grouped_id)
    }

    pub fn sequence_mut(&mut self, grouped_id: GroupedId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.grouped_id() == grouped_id)
    }

    pub(crate) fn first_running_mut(&mut self) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.is_running())
    }

    /// Append a sequence created during multi-sequence expansion.
    pub fn add_sequence(&mut self, sequence: Sequence) {
        self.sequences.push(sequence);
    }

    /// Mark every owned sequence dropped.
    pub fn drop_sequences(&mut self) {
        for seq in &mut self.sequences {
            seq.set_dropped();
        }
    }

    /// True once no sequence is running.
    pub fn has_finished(&self) -> bool {
        !self.sequences.iter().any(Sequence::is_running)
    }

    /// Prompt length plus the longest running continuation.
    pub fn context_len(&self) -> usize {
        self.prompt_len() + self.generated_len()
    }

    /// Longest generated length across running sequences.
    pub fn generated_len(&self) -> usize {
        self.running_sequences().map(Sequence::generated_len).max().unwrap_or(0)
    }

    /// Generation budget left before `max_new_tokens`.
    pub fn remaining_tokens(&self) -> usize {
        self.params.max_new_tokens.saturating_sub(self.generated_len())
    }

    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Set the processed-token counter, bounded by the context length.
    pub fn update_processed_tokens_num(&mut self, processed: usize) {
        self.num_processed_tokens = processed.min(self.context_len());
    }

    pub fn pause_generation(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True if the draft model may extend this request.
    pub fn can_generate_tokens(&self) -> bool {
        !self.paused && !self.has_finished()
    }

    pub fn set_num_validated_tokens(&mut self, count: usize) {
        self.num_validated_tokens = count;
    }

    /// Tokens committed by the last reconciliation, pending validation.
    pub fn num_tokens_to_validate(&self) -> usize {
        self.num_validated_tokens
    }
}
