//! Speculative-decoding synchronization engine.
//!
//! Holds the token-level data model (sequences, candidates, logit
//! processors), the reconciliation algorithms, the draft-loop step
//! controller and the `DraftPipeline` that ties them together.

pub mod candidates;
pub mod controller;
pub mod error;
pub mod logit_processor;
pub mod params;
pub mod pipeline;
pub mod reconcile;
pub mod sequence;

mod shared;
mod stats;

pub use candidates::{CandidateSet, GeneratedRequests, GeneratedSequence, UpdateRequestResult};
pub use controller::{pause_reason, DraftStep, MultistepOutcome, PauseReason, StepController};
pub use error::SyncError;
pub use logit_processor::{LogitProcessor, LogitProcessorFactory, ProcessorRegistry};
pub use params::{SamplingParams, SpeculativeMode};
pub use pipeline::{DraftPipeline, PipelineConfig};
pub use reconcile::{InitMode, PrefixLen};
pub use sequence::{FinishReason, GroupedId, Sequence, SequenceId, SequenceStatus};
pub use shared::SharedPipeline;
pub use stats::SyncStats;
