//! Metric recording through the `metrics` facade.
//!
//! Nothing is exported unless the embedding process installs a recorder;
//! without one every call here is a no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

pub const RECONCILIATIONS_TOTAL: &str = "specsync_reconciliations_total";
pub const TOKENS_REMOVED_TOTAL: &str = "specsync_tokens_removed_total";
pub const TOKENS_INSERTED_TOTAL: &str = "specsync_tokens_inserted_total";
pub const MICRO_STEPS_TOTAL: &str = "specsync_micro_steps_total";
pub const DRAFT_STEP_MS: &str = "specsync_draft_step_ms";
pub const REQUESTS_FINISHED_TOTAL: &str = "specsync_requests_finished_total";

/// Register descriptions for every metric. Safe to call repeatedly.
pub fn init_metrics() {
    describe_counter!(RECONCILIATIONS_TOTAL, "Candidate reconciliations applied");
    describe_counter!(TOKENS_REMOVED_TOTAL, "Tokens rolled back during reconciliation");
    describe_counter!(TOKENS_INSERTED_TOTAL, "Tokens committed during reconciliation");
    describe_counter!(MICRO_STEPS_TOTAL, "Draft micro-steps executed");
    describe_histogram!(DRAFT_STEP_MS, Unit::Milliseconds, "Draft step duration");
    describe_counter!(REQUESTS_FINISHED_TOTAL, "Requests released from the directory");
}

pub fn record_reconciliation(removed_tokens: usize, inserted_tokens: usize) {
    counter!(RECONCILIATIONS_TOTAL).increment(1);
    counter!(TOKENS_REMOVED_TOTAL).increment(removed_tokens as u64);
    counter!(TOKENS_INSERTED_TOTAL).increment(inserted_tokens as u64);
}

pub fn record_micro_step(elapsed: Duration) {
    counter!(MICRO_STEPS_TOTAL).increment(1);
    histogram!(DRAFT_STEP_MS).record(elapsed.as_secs_f64() * 1000.0);
}

pub fn record_request_finished() {
    counter!(REQUESTS_FINISHED_TOTAL).increment(1);
}
