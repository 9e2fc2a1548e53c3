//! Active request collection, indexed by request id.
//!
//! Requests join through an awaiting queue and are promoted to the active
//! set in admission order. The active set keeps that order, so every pass
//! over it is deterministic.

use std::collections::VecDeque;

use super::request::{Request, RequestId};
use crate::engine::candidates::{GeneratedRequests, GeneratedSequence};
use crate::engine::error::SyncError;
use crate::engine::logit_processor::LogitProcessorFactory;
use crate::engine::params::SamplingParams;
use crate::engine::sequence::SequenceId;
use crate::memory::BlockTableManager;
use crate::telemetry;

/// Monotonic source of process-unique sequence ids.
#[derive(Debug)]
pub struct SequenceIdAllocator {
    next: u64,
}

impl SequenceIdAllocator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn allocate(&mut self) -> SequenceId {
        let id = SequenceId(self.next);
        self.next += 1;
        id
    }
}

impl Default for SequenceIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of every admitted request.
#[derive(Debug, Default)]
pub struct RequestDirectory {
    active: Vec<Request>,
    awaiting: VecDeque<Request>,
    sequence_ids: SequenceIdAllocator,
}

impl RequestDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and queue a request for admission.
    ///
    /// # Errors
    ///
    /// Returns error on invalid sampling parameters or a duplicate id.
    pub fn add_request(
        &mut self,
        request_id: RequestId,
        prompt_ids: Vec<u32>,
        params: SamplingParams,
    ) -> Result<(), SyncError> {
        params.validate()?;
        if self.contains(request_id) || self.awaiting.iter().any(|r| r.id() == request_id) {
            return Err(SyncError::DuplicateRequest(request_id));
        }

        let first = self.sequence_ids.allocate();
        tracing::info!(
            request_id = request_id.0,
            prompt_len = prompt_ids.len(),
            speculative = params.is_speculative_decoding(),
            "request queued"
        );
        self.awaiting.push_back(Request::new(request_id, prompt_ids, params, first));
        Ok(())
    }

    /// Move every awaiting request into the active set, FIFO.
    pub fn pull_awaiting_requests(&mut self) -> usize {
        let admitted = self.awaiting.len();
        self.active.extend(self.awaiting.drain(..));
        admitted
    }

    pub fn allocate_sequence_id(&mut self) -> SequenceId {
        self.sequence_ids.allocate()
    }

    pub fn get(&self, request_id: RequestId) -> Option<&Request> {
        self.active.iter().find(|r| r.id() == request_id)
    }

    pub fn get_mut(&mut self, request_id: RequestId) -> Option<&mut Request> {
        self.active.iter_mut().find(|r| r.id() == request_id)
    }

    /// Request plus the sequence-id allocator, for expansion paths that
    /// create sequences while holding the request.
    pub(crate) fn get_mut_with_ids(
        &mut self,
        request_id: RequestId,
    ) -> Option<(&mut Request, &mut SequenceIdAllocator)> {
        let request = self.active.iter_mut().find(|r| r.id() == request_id)?;
        Some((request, &mut self.sequence_ids))
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.get(request_id).is_some()
    }

    /// Active requests in admission order.
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.active.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Request> {
        self.active.iter_mut()
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.active.iter().map(Request::id).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn num_awaiting(&self) -> usize {
        self.awaiting.len()
    }

    /// Release a request's KV blocks and logit processor, drop its
    /// sequences, and forget it. Returns false if the id is unknown.
    pub fn remove<K, F>(&mut self, request_id: RequestId, blocks: &mut K, processors: &mut F) -> bool
    where
        K: BlockTableManager + ?Sized,
        F: LogitProcessorFactory + ?Sized,
    {
        if let Some(pos) = self.awaiting.iter().position(|r| r.id() == request_id) {
            if let Some(mut request) = self.awaiting.remove(pos) {
                request.drop_sequences();
            }
            tracing::info!(request_id = request_id.0, "awaiting request removed");
            return true;
        }

        let Some(pos) = self.active.iter().position(|r| r.id() == request_id) else {
            return false;
        };

        let mut request = self.active.remove(pos);
        for seq in request.sequences() {
            if blocks.has_block_table(seq.id()) {
                blocks.free_sequence(seq.id());
            }
        }
        processors.remove_processor(request_id);
        request.drop_sequences();

        telemetry::record_request_finished();
        tracing::info!(
            request_id = request_id.0,
            generated_len = request.generated_len(),
            "request removed"
        );
        true
    }

    /// Remove every active request with no running sequence.
    pub fn remove_finished<K, F>(&mut self, blocks: &mut K, processors: &mut F) -> Vec<RequestId>
    where
        K: BlockTableManager + ?Sized,
        F: LogitProcessorFactory + ?Sized,
    {
        let finished: Vec<RequestId> = self
            .active
            .iter()
            .filter(|r| r.has_finished())
            .map(Request::id)
            .collect();
        for &id in &finished {
            self.remove(id, blocks, processors);
        }
        finished
    }

    /// Current tokens of every running sequence, keyed by request id then
    /// grouped id. Every active request gets an entry, possibly empty.
    ///
    /// # Errors
    ///
    /// Returns error if two running sequences of one request share a
    /// grouped id.
    pub fn snapshot_generated(&self) -> Result<GeneratedRequests, SyncError> {
        let mut result = GeneratedRequests::new();
        for request in &self.active {
            let generated = result.entry(request.id()).or_default();
            for seq in request.running_sequences() {
                let candidate = GeneratedSequence::new(
                    seq.generated_ids().to_vec(),
                    seq.generated_log_probs().to_vec(),
                )?;
                if generated.insert(seq.grouped_id(), candidate).is_some() {
                    return Err(SyncError::DuplicateGroupedId {
                        request_id: request.id(),
                        grouped_id: seq.grouped_id(),
                    });
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::logit_processor::ProcessorRegistry;
    use crate::engine::sequence::Sequence;
    use crate::memory::{BlockConfig, PagedBlockManager};

    fn params() -> SamplingParams {
        SamplingParams::with_assistant_tokens(2)
    }

    #[test]
    fn admission_is_fifo() {
        let mut dir = RequestDirectory::new();
        dir.add_request(RequestId(5), vec![1], params()).unwrap();
        dir.add_request(RequestId(2), vec![1], params()).unwrap();
        assert!(dir.is_empty());
        assert_eq!(dir.num_awaiting(), 2);

        assert_eq!(dir.pull_awaiting_requests(), 2);
        assert_eq!(dir.request_ids(), vec![RequestId(5), RequestId(2)]);
    }

    #[test]
    fn duplicate_and_invalid_requests_rejected() {
        let mut dir = RequestDirectory::new();
        dir.add_request(RequestId(1), vec![1], params()).unwrap();
        let err = dir.add_request(RequestId(1), vec![1], params()).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateRequest(RequestId(1))));

        let bad = SamplingParams::with_assistant_tokens(0);
        assert!(dir.add_request(RequestId(2), vec![1], bad).is_err());
    }

    #[test]
    fn sequence_ids_are_unique_across_requests() {
        let mut dir = RequestDirectory::new();
        dir.add_request(RequestId(1), vec![1], params()).unwrap();
        dir.add_request(RequestId(2), vec![1], params()).unwrap();
        dir.pull_awaiting_requests();

        let a = dir.get(RequestId(1)).unwrap().sequences()[0].id();
        let b = dir.get(RequestId(2)).unwrap().sequences()[0].id();
        assert_ne!(a, b);
        assert_ne!(dir.allocate_sequence_id(), a);
    }

    #[test]
    fn snapshot_rejects_duplicate_grouped_ids() {
        let mut dir = RequestDirectory::new();
        dir.add_request(RequestId(1), vec![1], params()).unwrap();
        dir.pull_awaiting_requests();
        let extra = dir.allocate_sequence_id();
        dir.get_mut(RequestId(1)).unwrap().add_sequence(Sequence::new(extra, 0));

        let err = dir.snapshot_generated().unwrap_err();
        assert!(matches!(err, SyncError::DuplicateGroupedId { grouped_id: 0, .. }));
    }

    #[test]
    fn remove_awaiting_request() {
        let mut dir = RequestDirectory::new();
        let mut blocks = PagedBlockManager::new(&BlockConfig::default());
        let mut processors = ProcessorRegistry::new();
        dir.add_request(RequestId(1), vec![1], params()).unwrap();

        assert!(dir.remove(RequestId(1), &mut blocks, &mut processors));
        assert_eq!(dir.num_awaiting(), 0);
        assert_eq!(dir.pull_awaiting_requests(), 0);
    }
}
