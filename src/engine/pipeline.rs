//! Draft-side pipeline: request directory, reconciliation and step control.
//!
//! The pipeline owns every piece of mutable state the synchronization core
//! touches: the request directory, the KV-cache block manager and the logit
//! processor store. All operations take `&mut self`; `SharedPipeline` adds
//! a lock for multi-threaded callers.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::candidates::{CandidateSet, GeneratedRequests, UpdateRequestResult};
use super::controller::{DraftStep, MultistepOutcome, StepController};
use super::error::SyncError;
use super::logit_processor::{LogitProcessorFactory, ProcessorRegistry};
use super::params::SamplingParams;
use super::reconcile::{
    init_request, insert_tokens_to_sequence, prefix_len, remove_tokens_from_sequence, InitMode,
};
use super::stats::SyncStats;
use crate::config::SyncConfig;
use crate::memory::{BlockTableManager, PagedBlockManager};
use crate::scheduler::{RequestDirectory, RequestId};
use crate::telemetry::{self, RequestSpan, SpanExt};

/// Pipeline behaviour switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Reconciliation clears the pause flag but never sets it.
    pub validation_mode: bool,
    /// Upper bound on micro-steps per multistep call. `None` is unlimited.
    pub max_micro_steps: Option<usize>,
}

/// Speculative-decoding synchronization core for one draft model.
#[derive(Debug)]
pub struct DraftPipeline<K = PagedBlockManager, F = ProcessorRegistry> {
    config: PipelineConfig,
    directory: RequestDirectory,
    blocks: K,
    processors: F,
    controller: StepController,
    stats: SyncStats,
}

impl DraftPipeline {
    /// Pipeline with the reference block manager and processor store.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.pipeline.clone(),
            PagedBlockManager::new(&config.blocks),
            ProcessorRegistry::new(),
        )
    }
}

impl<K, F> DraftPipeline<K, F>
where
    K: BlockTableManager,
    F: LogitProcessorFactory,
{
    pub fn new(config: PipelineConfig, blocks: K, processors: F) -> Self {
        let controller = StepController::new(config.max_micro_steps);
        Self {
            config,
            directory: RequestDirectory::new(),
            blocks,
            processors,
            controller,
            stats: SyncStats::default(),
        }
    }

    /// Queue a request. It becomes active on the next
    /// [`pull_awaiting_requests`](Self::pull_awaiting_requests).
    pub fn add_request(
        &mut self,
        request_id: RequestId,
        prompt_ids: Vec<u32>,
        params: SamplingParams,
    ) -> Result<(), SyncError> {
        self.directory.add_request(request_id, prompt_ids, params)
    }

    pub fn pull_awaiting_requests(&mut self) -> usize {
        self.directory.pull_awaiting_requests()
    }

    /// Align a request's running sequences with the draft candidates.
    ///
    /// Unknown request ids are a no-op returning zero counts. With
    /// `sync_logit_processor` set, the request's processor is incremented for
    /// committed tokens and told the new generated length.
    ///
    /// # Errors
    ///
    /// Returns error if the request is not speculative or its state breaks a
    /// reconciliation precondition.
    pub fn update_request(
        &mut self,
        request_id: RequestId,
        candidates: &CandidateSet,
        sync_logit_processor: bool,
    ) -> Result<UpdateRequestResult, SyncError> {
        let span = RequestSpan::reconcile(request_id.0, "update");
        let _guard = span.enter();

        let result = self.reconcile(request_id, candidates, sync_logit_processor);
        span.record_result(&result);
        if let Ok(r) = &result {
            self.record(request_id, r);
            span.record("removed_tokens", r.removed_tokens);
            span.record("inserted_tokens", r.inserted_tokens);
        }
        result
    }

    /// Seed every candidate of a fresh request, creating sequences for
    /// grouped ids it does not have yet.
    ///
    /// # Errors
    ///
    /// Returns error if the request is not speculative.
    pub fn init_request_by_candidate(
        &mut self,
        request_id: RequestId,
        candidates: &CandidateSet,
    ) -> Result<UpdateRequestResult, SyncError> {
        let span = RequestSpan::reconcile(request_id.0, "seed");
        let _guard = span.enter();

        let result = self.seed(request_id, candidates);
        span.record_result(&result);
        if let Ok(r) = &result {
            self.record(request_id, r);
            span.record("inserted_tokens", r.inserted_tokens);
        }
        result
    }

    fn seed(
        &mut self,
        request_id: RequestId,
        candidates: &CandidateSet,
    ) -> Result<UpdateRequestResult, SyncError> {
        let Some((request, sequence_ids)) = self.directory.get_mut_with_ids(request_id) else {
            return Ok(UpdateRequestResult::default());
        };
        if !request.is_speculative() {
            return Err(SyncError::NotSpeculative(request_id));
        }

        self.processors.create_processor(request_id, request.params(), request.prompt_ids());
        let processor = self
            .processors
            .get_processor(request_id)
            .ok_or(SyncError::MissingLogitProcessor(request_id))?;

        let inserted = init_request(
            request,
            candidates,
            processor,
            true,
            InitMode::AllSequences,
            sequence_ids,
        )?;
        request.set_num_validated_tokens(inserted);
        Ok(UpdateRequestResult::new(0, inserted))
    }

    fn reconcile(
        &mut self,
        request_id: RequestId,
        candidates: &CandidateSet,
        sync_logit_processor: bool,
    ) -> Result<UpdateRequestResult, SyncError> {
        let validation_mode = self.config.validation_mode;
        let Some((request, sequence_ids)) = self.directory.get_mut_with_ids(request_id) else {
            return Ok(UpdateRequestResult::default());
        };
        if !request.is_speculative() {
            return Err(SyncError::NotSpeculative(request_id));
        }

        let first_len = request
            .running_sequences()
            .next()
            .map(|s| s.generated_len())
            .ok_or(SyncError::NoRunningSequences(request_id))?;
        let generated_before = request.generated_len();
        let mut result = UpdateRequestResult::default();

        if first_len == 0 && request.num_tokens_to_validate() == 0 {
            self.processors.create_processor(request_id, request.params(), request.prompt_ids());
            let processor = self
                .processors
                .get_processor(request_id)
                .ok_or(SyncError::MissingLogitProcessor(request_id))?;
            result.inserted_tokens = init_request(
                request,
                candidates,
                processor,
                sync_logit_processor,
                InitMode::FirstSequence,
                sequence_ids,
            )?;
        } else if let Some(prefix) = prefix_len(request.running_sequences(), candidates) {
            let processor = self
                .processors
                .get_processor(request_id)
                .ok_or(SyncError::MissingLogitProcessor(request_id))?;
            for seq in request.running_sequences_mut() {
                let Some(candidate) = candidates.get(&seq.grouped_id()) else {
                    continue;
                };
                let removed =
                    remove_tokens_from_sequence(seq, prefix.min_generated_tokens, processor)?;
                let inserted = insert_tokens_to_sequence(
                    seq,
                    candidate,
                    prefix.min_candidate_len,
                    processor,
                    sync_logit_processor,
                )?;
                result.removed_tokens = result.removed_tokens.max(removed);
                result.inserted_tokens = result.inserted_tokens.max(inserted);
            }
            if sync_logit_processor {
                processor.update_generated_len(prefix.min_candidate_len);
            }
        }

        // Tokens already fed to the model and now rolled back must be
        // processed again.
        let mut generated_len = generated_before;
        let processed = request.num_processed_tokens();
        if processed > 0 {
            request.update_processed_tokens_num(processed.saturating_sub(result.removed_tokens));
            generated_len = generated_len.saturating_sub(result.removed_tokens);
        }

        request.set_num_validated_tokens(result.inserted_tokens);
        request.pause_generation(false);
        generated_len += result.inserted_tokens;

        let last_token = request.params().max_new_tokens.saturating_sub(1);
        if !validation_mode && (generated_len >= last_token || result.inserted_tokens == 0) {
            request.pause_generation(true);
        }
        Ok(result)
    }

    fn record(&mut self, request_id: RequestId, result: &UpdateRequestResult) {
        tracing::debug!(
            request_id = request_id.0,
            removed_tokens = result.removed_tokens,
            inserted_tokens = result.inserted_tokens,
            "reconciled"
        );
        telemetry::record_reconciliation(result.removed_tokens, result.inserted_tokens);
        self.stats.record_reconciliation(result);
    }

    /// Current tokens of every running sequence, per active request.
    ///
    /// # Errors
    ///
    /// Returns error if a request holds two running sequences with the same
    /// grouped id.
    pub fn get_generated_requests(&self) -> Result<GeneratedRequests, SyncError> {
        self.directory.snapshot_generated()
    }

    /// Release and forget a request. Unknown ids are a no-op.
    pub fn finish_request(&mut self, request_id: RequestId) -> bool {
        self.directory.remove(request_id, &mut self.blocks, &mut self.processors)
    }

    /// Release every request whose sequences have all stopped.
    pub fn remove_finished_requests(&mut self) -> Vec<RequestId> {
        self.directory.remove_finished(&mut self.blocks, &mut self.processors)
    }

    /// Run draft micro-steps until every active request is paused.
    pub fn multistep<D>(&mut self, draft: &mut D) -> Result<MultistepOutcome, SyncError>
    where
        D: DraftStep + ?Sized,
    {
        self.run_multistep(draft, None)
    }

    /// Like [`multistep`](Self::multistep), stopping early once `cancel` fires.
    /// The token is checked before every micro-step.
    pub fn multistep_with_cancel<D>(
        &mut self,
        draft: &mut D,
        cancel: &CancellationToken,
    ) -> Result<MultistepOutcome, SyncError>
    where
        D: DraftStep + ?Sized,
    {
        self.run_multistep(draft, Some(cancel))
    }

    fn run_multistep<D>(
        &mut self,
        draft: &mut D,
        cancel: Option<&CancellationToken>,
    ) -> Result<MultistepOutcome, SyncError>
    where
        D: DraftStep + ?Sized,
    {
        let span = RequestSpan::multistep(self.directory.len());
        let _guard = span.enter();

        let result = self.controller.run(
            &mut self.directory,
            &mut self.processors,
            draft,
            cancel,
            &mut self.stats,
        );
        span.record_result(&result);
        if let Ok(outcome) = &result {
            span.record("micro_steps", outcome.micro_steps);
        }
        result
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_validation_mode(&self) -> bool {
        self.config.validation_mode
    }

    pub fn directory(&self) -> &RequestDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut RequestDirectory {
        &mut self.directory
    }

    pub fn blocks(&self) -> &K {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut K {
        &mut self.blocks
    }

    pub fn processors(&self) -> &F {
        &self.processors
    }

    pub fn processors_mut(&mut self) -> &mut F {
        &mut self.processors
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::candidates::GeneratedSequence;

    fn pipeline() -> DraftPipeline {
        DraftPipeline::from_config(&SyncConfig::default())
    }

    fn candidates(tokens: &[u32]) -> CandidateSet {
        let mut set = CandidateSet::new();
        set.insert(0, GeneratedSequence::from_tokens(tokens));
        set
    }

    #[test]
    fn unknown_request_is_noop() {
        let mut p = pipeline();
        let result = p.update_request(RequestId(42), &candidates(&[1]), true).unwrap();
        assert_eq!(result, UpdateRequestResult::default());
        assert!(!p.finish_request(RequestId(42)));
    }

    #[test]
    fn first_touch_seeds_first_sequence() {
        let mut p = pipeline();
        p.add_request(RequestId(1), vec![9, 9], SamplingParams::with_assistant_tokens(4))
            .unwrap();
        p.pull_awaiting_requests();

        let result = p.update_request(RequestId(1), &candidates(&[3, 4]), true).unwrap();
        assert_eq!(result, UpdateRequestResult::new(0, 2));

        let request = p.directory().get(RequestId(1)).unwrap();
        assert_eq!(request.sequence(0).unwrap().generated_ids(), &[3, 4]);
        assert_eq!(request.num_tokens_to_validate(), 2);
        assert!(request.can_generate_tokens());
        assert_eq!(p.processors().processor(RequestId(1)).unwrap().occurrences(3), 1);
    }

    #[test]
    fn validation_mode_never_repauses() {
        let config = SyncConfig {
            pipeline: PipelineConfig { validation_mode: true, max_micro_steps: None },
            ..SyncConfig::default()
        };
        let mut p = DraftPipeline::from_config(&config);
        p.add_request(RequestId(1), vec![1], SamplingParams::with_assistant_tokens(2))
            .unwrap();
        p.pull_awaiting_requests();

        let result = p.update_request(RequestId(1), &candidates(&[]), false).unwrap();
        assert_eq!(result.inserted_tokens, 0);
        assert!(p.directory().get(RequestId(1)).unwrap().can_generate_tokens());
    }

    #[test]
    fn non_speculative_update_rejected() {
        let mut p = pipeline();
        p.add_request(RequestId(1), vec![1], SamplingParams::default()).unwrap();
        p.pull_awaiting_requests();
        let err = p.update_request(RequestId(1), &candidates(&[1]), true).unwrap_err();
        assert!(err.is_precondition_violation());
        assert_eq!(p.stats().total_reconciliations, 0);
    }
}
