//! Reconciliation of running sequences against draft candidates.
//!
//! Every reconciled sequence of a request is cut back to the shortest
//! agreed prefix and refilled to the shortest candidate length, so all
//! sequences of a request stay the same length afterwards. Sequences that
//! agreed longer than the minimum give those tokens up.

use super::candidates::{CandidateSet, GeneratedSequence};
use super::error::SyncError;
use super::logit_processor::LogitProcessor;
use super::sequence::Sequence;
use crate::scheduler::{Request, SequenceIdAllocator};

/// Agreement between running sequences and their candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixLen {
    /// Shortest agreed prefix across compared sequences.
    pub min_generated_tokens: usize,
    /// Shortest candidate across compared sequences.
    pub min_candidate_len: usize,
}

/// How first-touch initialization seeds a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Seed only the first running sequence; other sequences are expanded
    /// later by validation.
    FirstSequence,
    /// Seed every candidate, creating sequences as needed.
    AllSequences,
}

/// Compare each running sequence with its candidate.
///
/// Returns `None` if no running sequence has a candidate.
pub fn prefix_len<'a, I>(running: I, candidates: &CandidateSet) -> Option<PrefixLen>
where
    I: IntoIterator<Item = &'a Sequence>,
{
    let mut prefix: Option<PrefixLen> = None;
    for seq in running {
        let Some(candidate) = candidates.get(&seq.grouped_id()) else {
            continue;
        };

        let agreed = seq
            .generated_ids()
            .iter()
            .zip(candidate.token_ids())
            .take_while(|(running, proposed)| running == proposed)
            .count();

        prefix = Some(match prefix {
            None => PrefixLen { min_generated_tokens: agreed, min_candidate_len: candidate.len() },
            Some(p) => PrefixLen {
                min_generated_tokens: p.min_generated_tokens.min(agreed),
                min_candidate_len: p.min_candidate_len.min(candidate.len()),
            },
        });
    }
    prefix
}

/// Roll `seq` back to `min_generated_tokens`, decreasing the processor
/// count of every removed token. Returns the number of removed tokens.
///
/// # Errors
///
/// Returns error if the sequence is shorter than `min_generated_tokens`.
pub fn remove_tokens_from_sequence(
    seq: &mut Sequence,
    min_generated_tokens: usize,
    processor: &mut LogitProcessor,
) -> Result<usize, SyncError> {
    let generated = seq.generated_len();
    if generated < min_generated_tokens {
        return Err(SyncError::RollbackBeyondLength { generated, required: min_generated_tokens });
    }

    for &token in &seq.generated_ids()[min_generated_tokens..] {
        processor.decrease_generated_token_occurrence(token);
    }
    seq.truncate(min_generated_tokens);
    Ok(generated - min_generated_tokens)
}

/// Append the tokens of `candidate[..len]` that lie beyond the sequence's
/// current length. Returns the number of inserted tokens.
///
/// Processor counts are only incremented when `update_processor` is set;
/// the target-side processor is maintained by its own sampler.
///
/// # Errors
///
/// Returns error if the sequence already holds more than `len` tokens, or
/// `len` exceeds the candidate.
pub fn insert_tokens_to_sequence(
    seq: &mut Sequence,
    candidate: &GeneratedSequence,
    len: usize,
    processor: &mut LogitProcessor,
    update_processor: bool,
) -> Result<usize, SyncError> {
    let generated = seq.generated_len();
    if generated > len || len > candidate.len() {
        return Err(SyncError::InsertBeyondCandidate { generated, candidate: len.min(candidate.len()) });
    }

    let tokens = &candidate.token_ids()[generated..len];
    let log_probs = &candidate.log_probs()[generated..len];
    for (&token, &log_prob) in tokens.iter().zip(log_probs) {
        seq.append_token(token, log_prob);
        if update_processor {
            processor.register_new_generated_token(token);
        }
    }
    Ok(len - generated)
}

/// Seed a request that has not generated anything yet directly from the
/// candidates. Returns the committed length.
///
/// `FirstSequence` commits the whole first candidate, or a single token
/// when the request asks for several sequences. `AllSequences` commits the
/// shortest candidate length to every sequence.
///
/// # Errors
///
/// Returns error if the request is not speculative or has no running
/// sequence to seed.
pub fn init_request(
    request: &mut Request,
    candidates: &CandidateSet,
    processor: &mut LogitProcessor,
    update_processor: bool,
    mode: InitMode,
    sequence_ids: &mut SequenceIdAllocator,
) -> Result<usize, SyncError> {
    let request_id = request.id();
    if !request.is_speculative() {
        return Err(SyncError::NotSpeculative(request_id));
    }
    let Some(first) = candidates.values().next() else {
        return Ok(0);
    };
    if first.is_empty() && mode == InitMode::FirstSequence {
        return Ok(0);
    }

    let committed_len = match mode {
        InitMode::AllSequences => candidates.values().map(GeneratedSequence::len).min().unwrap_or(0),
        InitMode::FirstSequence if request.params().num_return_sequences == 1 => first.len(),
        InitMode::FirstSequence => 1,
    };

    for (&grouped_id, candidate) in candidates {
        let seq = match mode {
            InitMode::FirstSequence => request
                .first_running_mut()
                .ok_or(SyncError::NoRunningSequences(request_id))?,
            InitMode::AllSequences => {
                if request.sequence(grouped_id).is_none() {
                    request.add_sequence(Sequence::new(sequence_ids.allocate(), grouped_id));
                }
                request
                    .sequence_mut(grouped_id)
                    .ok_or(SyncError::NoRunningSequences(request_id))?
            }
        };

        let tokens = &candidate.token_ids()[..committed_len];
        let log_probs = &candidate.log_probs()[..committed_len];
        for (&token, &log_prob) in tokens.iter().zip(log_probs) {
            seq.append_token(token, log_prob);
            if update_processor {
                processor.register_new_generated_token(token);
            }
        }

        if mode == InitMode::FirstSequence {
            break;
        }
    }
    Ok(committed_len)
}
