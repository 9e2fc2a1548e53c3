//! Per-request token statistics used for repetition-style penalties.
//!
//! The counters must mirror the token buffers they describe: every committed
//! token is registered, every rolled-back token is decreased.

use std::collections::{HashMap, HashSet};

use super::params::SamplingParams;
use crate::scheduler::RequestId;

/// Occurrence counters for one request.
#[derive(Debug, Clone)]
pub struct LogitProcessor {
    repetition_penalty: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    prompt_tokens: HashSet<u32>,
    generated_occurrences: HashMap<u32, usize>,
    generated_len: usize,
}

impl LogitProcessor {
    /// Create a processor seeded with the request's prompt.
    pub fn new(params: &SamplingParams, prompt_ids: &[u32]) -> Self {
        Self {
            repetition_penalty: params.repetition_penalty,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            prompt_tokens: prompt_ids.iter().copied().collect(),
            generated_occurrences: HashMap::new(),
            generated_len: 0,
        }
    }

    /// Count one more occurrence of a committed token.
    pub fn register_new_generated_token(&mut self, token_id: u32) {
        *self.generated_occurrences.entry(token_id).or_insert(0) += 1;
    }

    /// Remove one occurrence of a rolled-back token.
    ///
    /// Tokens registered by the target-side sampler may never have been
    /// counted here; decreasing an absent token is a no-op.
    pub fn decrease_generated_token_occurrence(&mut self, token_id: u32) {
        match self.generated_occurrences.get_mut(&token_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.generated_occurrences.remove(&token_id);
            }
            None => {
                tracing::debug!(token_id, "decrease of unregistered token ignored");
            }
        }
    }

    /// Record how many tokens the sequences of this request hold.
    pub fn update_generated_len(&mut self, len: usize) {
        self.generated_len = len;
    }

    pub fn generated_len(&self) -> usize {
        self.generated_len
    }

    /// Number of times `token_id` is currently counted as generated.
    pub fn occurrences(&self, token_id: u32) -> usize {
        self.generated_occurrences.get(&token_id).copied().unwrap_or(0)
    }

    /// Number of distinct generated tokens with a non-zero count.
    pub fn distinct_generated(&self) -> usize {
        self.generated_occurrences.len()
    }

    /// Total number of counted generated tokens.
    pub fn total_generated_occurrences(&self) -> usize {
        self.generated_occurrences.values().sum()
    }

    /// Apply repetition, frequency and presence penalties in place.
    ///
    /// Token ids outside the logits slice are ignored.
    pub fn apply_penalties(&self, logits: &mut [f32]) {
        if self.repetition_penalty != 1.0 {
            let seen = self
                .prompt_tokens
                .iter()
                .chain(self.generated_occurrences.keys())
                .collect::<HashSet<_>>();
            for &token in seen {
                if let Some(logit) = logits.get_mut(token as usize) {
                    if *logit > 0.0 {
                        *logit /= self.repetition_penalty;
                    } else {
                        *logit *= self.repetition_penalty;
                    }
                }
            }
        }

        if self.frequency_penalty != 0.0 || self.presence_penalty != 0.0 {
            for (&token, &count) in &self.generated_occurrences {
                if let Some(logit) = logits.get_mut(token as usize) {
                    *logit -= self.frequency_penalty * count as f32 + self.presence_penalty;
                }
            }
        }
    }
}

/// Sampler-side store of logit processors, one per request.
pub trait LogitProcessorFactory {
    /// Create (or reset) the processor for a request.
    fn create_processor(&mut self, request_id: RequestId, params: &SamplingParams, prompt_ids: &[u32]);

    /// Processor for a request, if one is active.
    fn get_processor(&mut self, request_id: RequestId) -> Option<&mut LogitProcessor>;

    /// Drop the processor for a request. No-op if absent.
    fn remove_processor(&mut self, request_id: RequestId);

    fn has_processor(&self, request_id: RequestId) -> bool;
}

/// In-memory processor store keyed by request id.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<RequestId, LogitProcessor>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Read-only view of a request's processor.
    pub fn processor(&self, request_id: RequestId) -> Option<&LogitProcessor> {
        self.processors.get(&request_id)
    }
}

impl LogitProcessorFactory for ProcessorRegistry {
    fn create_processor(&mut self, request_id: RequestId, params: &SamplingParams, prompt_ids: &[u32]) {
        self.processors.insert(request_id, LogitProcessor::new(params, prompt_ids));
    }

    fn get_processor(&mut self, request_id: RequestId) -> Option<&mut LogitProcessor> {
        self.processors.get_mut(&request_id)
    }

    fn remove_processor(&mut self, request_id: RequestId) {
        self.processors.remove(&request_id);
    }

    fn has_processor(&self, request_id: RequestId) -> bool {
        self.processors.contains_key(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> LogitProcessor {
        LogitProcessor::new(&SamplingParams::default(), &[1, 2])
    }

    #[test]
    fn register_and_decrease_track_counts() {
        let mut p = processor();
        p.register_new_generated_token(5);
        p.register_new_generated_token(5);
        p.register_new_generated_token(6);
        assert_eq!(p.occurrences(5), 2);
        assert_eq!(p.total_generated_occurrences(), 3);

        p.decrease_generated_token_occurrence(5);
        p.decrease_generated_token_occurrence(6);
        assert_eq!(p.occurrences(5), 1);
        assert_eq!(p.occurrences(6), 0);
        assert_eq!(p.distinct_generated(), 1);
    }

    #[test]
    fn decrease_of_unknown_token_is_noop() {
        let mut p = processor();
        p.decrease_generated_token_occurrence(99);
        assert_eq!(p.occurrences(99), 0);
        assert_eq!(p.distinct_generated(), 0);
    }

    #[test]
    fn repetition_penalty_covers_prompt_and_generated() {
        let params = SamplingParams::default().repetition_penalty(2.0);
        let mut p = LogitProcessor::new(&params, &[0]);
        p.register_new_generated_token(1);

        let mut logits = vec![4.0, -4.0, 4.0];
        p.apply_penalties(&mut logits);
        assert_eq!(logits, vec![2.0, -8.0, 4.0]);
    }

    #[test]
    fn frequency_and_presence_penalties() {
        let params = SamplingParams::default().frequency_penalty(0.5).presence_penalty(1.0);
        let mut p = LogitProcessor::new(&params, &[]);
        p.register_new_generated_token(1);
        p.register_new_generated_token(1);
        p.register_new_generated_token(7); // out of range

        let mut logits = vec![0.0, 3.0];
        p.apply_penalties(&mut logits);
        assert_eq!(logits, vec![0.0, 1.0]);
    }

    #[test]
    fn registry_create_resets_state() {
        let mut registry = ProcessorRegistry::new();
        let id = RequestId(1);
        registry.create_processor(id, &SamplingParams::default(), &[]);
        registry.get_processor(id).unwrap().register_new_generated_token(3);

        registry.create_processor(id, &SamplingParams::default(), &[]);
        assert_eq!(registry.processor(id).unwrap().occurrences(3), 0);

        registry.remove_processor(id);
        assert!(!registry.has_processor(id));
        assert!(registry.is_empty());
    }
}
