//! Telemetry for the synchronization core.
//!
//! Structured logging, tracing spans and metrics. No network dependencies;
//! exporters belong to the embedding process.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_micro_step, record_reconciliation, record_request_finished,
    DRAFT_STEP_MS, MICRO_STEPS_TOTAL, RECONCILIATIONS_TOTAL, REQUESTS_FINISHED_TOTAL,
    TOKENS_INSERTED_TOTAL, TOKENS_REMOVED_TOTAL,
};
pub use spans::{RequestSpan, SpanExt};
