//! Thread-shareable pipeline handle.
//!
//! Uses parking_lot::Mutex for fast synchronous locking. The draft thread
//! and the validation thread take turns; no two operations interleave.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::candidates::{CandidateSet, GeneratedRequests, UpdateRequestResult};
use super::controller::{DraftStep, MultistepOutcome};
use super::error::SyncError;
use super::logit_processor::{LogitProcessorFactory, ProcessorRegistry};
use super::params::SamplingParams;
use super::pipeline::DraftPipeline;
use super::stats::SyncStats;
use crate::memory::{BlockTableManager, PagedBlockManager};
use crate::scheduler::RequestId;

/// Cloneable handle to one pipeline.
pub struct SharedPipeline<K = PagedBlockManager, F = ProcessorRegistry> {
    inner: Arc<Mutex<DraftPipeline<K, F>>>,
}

impl<K, F> Clone for SharedPipeline<K, F> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, F> SharedPipeline<K, F>
where
    K: BlockTableManager,
    F: LogitProcessorFactory,
{
    pub fn new(pipeline: DraftPipeline<K, F>) -> Self {
        Self { inner: Arc::new(Mutex::new(pipeline)) }
    }

    /// Exclusive access for multi-call sequences.
    pub fn lock(&self) -> MutexGuard<'_, DraftPipeline<K, F>> {
        self.inner.lock()
    }

    pub fn add_request(
        &self,
        request_id: RequestId,
        prompt_ids: Vec<u32>,
        params: SamplingParams,
    ) -> Result<(), SyncError> {
        self.inner.lock().add_request(request_id, prompt_ids, params)
    }

    pub fn pull_awaiting_requests(&self) -> usize {
        self.inner.lock().pull_awaiting_requests()
    }

    pub fn update_request(
        &self,
        request_id: RequestId,
        candidates: &CandidateSet,
        sync_logit_processor: bool,
    ) -> Result<UpdateRequestResult, SyncError> {
        self.inner.lock().update_request(request_id, candidates, sync_logit_processor)
    }

    pub fn init_request_by_candidate(
        &self,
        request_id: RequestId,
        candidates: &CandidateSet,
    ) -> Result<UpdateRequestResult, SyncError> {
        self.inner.lock().init_request_by_candidate(request_id, candidates)
    }

    pub fn get_generated_requests(&self) -> Result<GeneratedRequests, SyncError> {
        self.inner.lock().get_generated_requests()
    }

    pub fn finish_request(&self, request_id: RequestId) -> bool {
        self.inner.lock().finish_request(request_id)
    }

    /// Holds the lock for the whole call, draft steps included.
    pub fn multistep<D>(&self, draft: &mut D) -> Result<MultistepOutcome, SyncError>
    where
        D: DraftStep + ?Sized,
    {
        self.inner.lock().multistep(draft)
    }

    pub fn multistep_with_cancel<D>(
        &self,
        draft: &mut D,
        cancel: &CancellationToken,
    ) -> Result<MultistepOutcome, SyncError>
    where
        D: DraftStep + ?Sized,
    {
        self.inner.lock().multistep_with_cancel(draft, cancel)
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.lock().stats().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::candidates::GeneratedSequence;
    use std::thread;

    #[test]
    fn clones_share_state_across_threads() {
        let shared = SharedPipeline::new(DraftPipeline::from_config(&SyncConfig::default()));
        shared
            .add_request(RequestId(1), vec![1, 2], SamplingParams::with_assistant_tokens(3))
            .unwrap();
        shared.pull_awaiting_requests();

        let worker = shared.clone();
        let handle = thread::spawn(move || {
            let mut set = CandidateSet::new();
            set.insert(0, GeneratedSequence::from_tokens(&[5, 6]));
            worker.update_request(RequestId(1), &set, true)
        });
        let result = handle.join().unwrap().unwrap();
        assert_eq!(result.inserted_tokens, 2);

        let generated = shared.get_generated_requests().unwrap();
        assert_eq!(generated[&RequestId(1)][&0].token_ids(), &[5, 6]);
        assert_eq!(shared.stats().total_inserted, 2);
    }
}
