//! SpecSync Core
//!
//! Request synchronization for speculative decoding. A fast draft model
//! proposes token continuations; this crate reconciles them against the
//! sequences grown for each in-flight request, rolls back divergent
//! tokens, keeps per-request repetition statistics in step with the token
//! buffers, and decides how many micro-steps the draft model runs next.
//!
//! # Boundaries
//!
//! - Model execution, tokenization and sampling live outside this crate.
//! - KV-cache blocks are reached through [`memory::BlockTableManager`].
//! - Draft steps are reached through [`engine::DraftStep`].
//! - In-process library only: no wire format, no CLI.
//!
//! # Example
//!
//! ```
//! use specsync_core::engine::{CandidateSet, DraftPipeline, GeneratedSequence, SamplingParams};
//! use specsync_core::scheduler::RequestId;
//! use specsync_core::SyncConfig;
//!
//! let mut pipeline = DraftPipeline::from_config(&SyncConfig::default());
//! pipeline.add_request(RequestId(1), vec![10, 11, 12], SamplingParams::with_assistant_tokens(3))?;
//! pipeline.pull_awaiting_requests();
//!
//! let mut candidates = CandidateSet::new();
//! candidates.insert(0, GeneratedSequence::from_tokens(&[7, 8]));
//! let result = pipeline.update_request(RequestId(1), &candidates, true)?;
//! assert_eq!(result.inserted_tokens, 2);
//! # Ok::<(), specsync_core::engine::SyncError>(())
//! ```

pub mod config;
pub mod engine;
pub mod memory;
pub mod scheduler;
pub mod telemetry;

pub use config::{EffectiveConfig, SyncConfig};
pub use engine::{DraftPipeline, SharedPipeline, SyncError};
