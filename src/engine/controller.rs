//! Draft-loop step controller.
//!
//! One `multistep` call runs draft micro-steps until every active request
//! is paused. Tokens are produced by the draft step and corrected by
//! reconciliation. The controller flips pause flags and keeps each request's
//! logit processor in step with what the draft appended.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::logit_processor::LogitProcessorFactory;
use super::params::SpeculativeMode;
use super::sequence::GroupedId;
use super::stats::SyncStats;
use crate::scheduler::{Request, RequestDirectory, RequestId};
use crate::telemetry;

/// External draft-model step.
///
/// One call advances every request that can generate by one token, through
/// the normal sequence append path.
///
/// Every request that can generate has a logit processor in `processors`
/// when the step starts; the draft reads it to penalize its logits. Appended
/// tokens are registered by the controller after the step, so the draft
/// must not register them itself.
pub trait DraftStep {
    fn extend_active_requests(
        &mut self,
        directory: &mut RequestDirectory,
        processors: &mut dyn LogitProcessorFactory,
    ) -> Result<(), SyncError>;
}

impl<F> DraftStep for F
where
    F: FnMut(&mut RequestDirectory, &mut dyn LogitProcessorFactory) -> Result<(), SyncError>,
{
    fn extend_active_requests(
        &mut self,
        directory: &mut RequestDirectory,
        processors: &mut dyn LogitProcessorFactory,
    ) -> Result<(), SyncError> {
        self(directory, processors)
    }
}

/// Why a request stopped draft extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// No speculative knob set; one step only.
    NotSpeculative,
    /// Multi-sequence request whose prompt has not been processed yet.
    AwaitingPromptExpansion,
    /// Assistant-token budget spent for this round.
    AssistantBudgetReached,
    /// The next token would be the last one; it belongs to the target model.
    LastTokenReserved,
    /// `max_new_tokens == 0`.
    ZeroTokenBudget,
}

/// Evaluate the pause conditions for `request` after `steps` micro-steps.
///
/// Conditions are checked in a fixed order and the first match wins.
pub fn pause_reason(request: &Request, steps: usize) -> Option<PauseReason> {
    let params = request.params();

    if !request.is_speculative() {
        return Some(PauseReason::NotSpeculative);
    }
    if request.num_processed_tokens() == 0 && params.num_return_sequences > 1 {
        return Some(PauseReason::AwaitingPromptExpansion);
    }
    if let SpeculativeMode::AssistantTokens(budget) = params.speculative {
        if budget <= steps {
            return Some(PauseReason::AssistantBudgetReached);
        }
    }
    let generated = request.context_len().saturating_sub(request.prompt_len());
    if generated >= params.max_new_tokens.saturating_sub(1) && params.max_new_tokens > 0 {
        return Some(PauseReason::LastTokenReserved);
    }
    if params.max_new_tokens == 0 {
        return Some(PauseReason::ZeroTokenBudget);
    }
    None
}

type SequenceLengths = HashMap<(RequestId, GroupedId), usize>;

/// Create processors for requests the draft is about to extend.
fn ensure_processors(directory: &RequestDirectory, processors: &mut dyn LogitProcessorFactory) {
    for request in directory.iter().filter(|r| r.can_generate_tokens()) {
        if !processors.has_processor(request.id()) {
            processors.create_processor(request.id(), request.params(), request.prompt_ids());
        }
    }
}

fn running_lengths(directory: &RequestDirectory) -> SequenceLengths {
    directory
        .iter()
        .flat_map(|request| {
            request
                .running_sequences()
                .map(move |seq| ((request.id(), seq.grouped_id()), seq.generated_len()))
        })
        .collect()
}

/// Register the tokens appended since `before` with each request's processor.
///
/// Sequences created during the step count from zero.
fn register_appended(
    directory: &RequestDirectory,
    processors: &mut dyn LogitProcessorFactory,
    before: &SequenceLengths,
) {
    for request in directory.iter() {
        let id = request.id();
        for seq in request.running_sequences() {
            let start = before.get(&(id, seq.grouped_id())).copied().unwrap_or(0);
            let appended = seq.generated_ids().get(start..).unwrap_or_default();
            if appended.is_empty() {
                continue;
            }
            if !processors.has_processor(id) {
                processors.create_processor(id, request.params(), request.prompt_ids());
            }
            if let Some(processor) = processors.get_processor(id) {
                for &token in appended {
                    processor.register_new_generated_token(token);
                }
                processor.update_generated_len(seq.generated_len());
            }
        }
    }
}

/// Summary of one multistep call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultistepOutcome {
    /// Micro-steps executed.
    pub micro_steps: usize,
    /// Stopped by the cancellation token.
    pub cancelled: bool,
    /// Stopped by the micro-step cap.
    pub capped: bool,
    /// Requests paused during this call, with the step and reason.
    pub paused: BTreeMap<RequestId, (usize, PauseReason)>,
}

/// Runs micro-steps and evaluates pause conditions.
#[derive(Debug, Clone, Default)]
pub struct StepController {
    max_micro_steps: Option<usize>,
}

impl StepController {
    pub fn new(max_micro_steps: Option<usize>) -> Self {
        Self { max_micro_steps }
    }

    pub fn max_micro_steps(&self) -> Option<usize> {
        self.max_micro_steps
    }

    /// Run micro-steps until no active request can generate.
    ///
    /// The first micro-step always runs unless cancellation was requested
    /// beforehand.
    ///
    /// # Errors
    ///
    /// Propagates draft step failures. Steps completed before the failure
    /// keep their effects.
    pub fn run<D>(
        &self,
        directory: &mut RequestDirectory,
        processors: &mut dyn LogitProcessorFactory,
        draft: &mut D,
        cancel: Option<&CancellationToken>,
        stats: &mut SyncStats,
    ) -> Result<MultistepOutcome, SyncError>
    where
        D: DraftStep + ?Sized,
    {
        let mut outcome = MultistepOutcome::default();
        let mut to_generate = true;

        while to_generate {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                tracing::warn!(micro_steps = outcome.micro_steps, "multistep cancelled");
                outcome.cancelled = true;
                break;
            }
            if let Some(cap) = self.max_micro_steps {
                if outcome.micro_steps >= cap {
                    tracing::warn!(cap, "micro-step cap reached, pausing all requests");
                    for request in directory.iter_mut() {
                        request.pause_generation(true);
                    }
                    outcome.capped = true;
                    break;
                }
            }

            outcome.micro_steps += 1;
            ensure_processors(directory, processors);
            let before = running_lengths(directory);
            let start = Instant::now();
            let stepped = draft.extend_active_requests(directory, processors);
            let elapsed = start.elapsed();
            register_appended(directory, processors, &before);
            stepped?;
            tracing::debug!(
                step = outcome.micro_steps,
                elapsed_ms = elapsed.as_millis() as u64,
                "draft step"
            );
            telemetry::record_micro_step(elapsed);
            stats.record_micro_step(elapsed);

            to_generate = false;
            for request in directory.iter_mut() {
                if let Some(reason) = pause_reason(request, outcome.micro_steps) {
                    if !request.is_paused() {
                        tracing::trace!(request_id = request.id().0, ?reason, "request paused");
                        outcome.paused.insert(request.id(), (outcome.micro_steps, reason));
                    }
                    request.pause_generation(true);
                }
                to_generate |= request.can_generate_tokens();
            }
        }

        stats.record_multistep();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::logit_processor::ProcessorRegistry;
    use crate::engine::params::SamplingParams;
    use crate::engine::sequence::SequenceId;

    fn request(params: SamplingParams) -> Request {
        Request::new(RequestId(1), vec![1, 2], params, SequenceId(0))
    }

    #[test]
    fn non_speculative_pauses_first() {
        let req = request(SamplingParams::default().max_new_tokens(0));
        assert_eq!(pause_reason(&req, 1), Some(PauseReason::NotSpeculative));
    }

    #[test]
    fn multi_sequence_waits_for_prompt() {
        let req = request(SamplingParams::with_assistant_tokens(4).num_return_sequences(2));
        assert_eq!(pause_reason(&req, 1), Some(PauseReason::AwaitingPromptExpansion));
    }

    #[test]
    fn budget_checked_before_length() {
        let mut req = request(SamplingParams::with_assistant_tokens(2).max_new_tokens(3));
        req.sequence_mut(0).unwrap().append_token(5, 0.0);
        req.sequence_mut(0).unwrap().append_token(6, 0.0);
        assert_eq!(pause_reason(&req, 1), Some(PauseReason::LastTokenReserved));
        assert_eq!(pause_reason(&req, 2), Some(PauseReason::AssistantBudgetReached));
    }

    #[test]
    fn threshold_mode_has_no_step_budget() {
        let req = request(SamplingParams::with_confidence_threshold(0.4).max_new_tokens(100));
        assert_eq!(pause_reason(&req, 1000), None);
    }

    #[test]
    fn zero_budget_pauses() {
        let req = request(SamplingParams::with_assistant_tokens(3).max_new_tokens(0));
        assert_eq!(pause_reason(&req, 1), Some(PauseReason::ZeroTokenBudget));
    }

    #[test]
    fn empty_directory_runs_one_step() {
        let mut directory = RequestDirectory::new();
        let mut calls = 0;
        let mut draft =
            |_: &mut RequestDirectory, _: &mut dyn LogitProcessorFactory| -> Result<(), SyncError> {
                calls += 1;
                Ok(())
            };
        let mut stats = SyncStats::default();
        let outcome = StepController::default()
            .run(&mut directory, &mut ProcessorRegistry::new(), &mut draft, None, &mut stats)
            .unwrap();
        assert_eq!(outcome.micro_steps, 1);
        assert_eq!(calls, 1);
        assert_eq!(stats.total_multisteps, 1);
    }

    #[test]
    fn appended_tokens_are_registered() {
        let mut directory = RequestDirectory::new();
        directory
            .add_request(RequestId(1), vec![1], SamplingParams::with_assistant_tokens(2))
            .unwrap();
        directory.pull_awaiting_requests();
        let mut processors = ProcessorRegistry::new();

        let mut draft = |directory: &mut RequestDirectory,
                         processors: &mut dyn LogitProcessorFactory|
         -> Result<(), SyncError> {
            for request in directory.iter_mut() {
                assert!(processors.has_processor(request.id()));
                if let Some(seq) = request.running_sequences_mut().next() {
                    seq.append_token(8, 0.0);
                }
            }
            Ok(())
        };
        StepController::default()
            .run(&mut directory, &mut processors, &mut draft, None, &mut SyncStats::default())
            .unwrap();

        let processor = processors.processor(RequestId(1)).unwrap();
        assert_eq!(processor.occurrences(8), 2);
        assert_eq!(processor.generated_len(), 2);
    }
}
