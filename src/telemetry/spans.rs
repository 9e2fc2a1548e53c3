//! Span utilities and extension traits for pipeline tracing.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for creating standardized request spans.
pub struct RequestSpan;

impl RequestSpan {
    /// Span around one candidate reconciliation.
    ///
    /// Fields included:
    /// - `request_id`: Request being reconciled
    /// - `mode`: `update` or `seed`
    /// - `removed_tokens` / `inserted_tokens`: Filled in on success
    /// - `status` / `error.message`: Filled in by `SpanExt::record_result`
    pub fn reconcile(request_id: u64, mode: &'static str) -> Span {
        info_span!(
            "reconcile",
            request_id,
            mode,
            removed_tokens = tracing::field::Empty,
            inserted_tokens = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }

    /// Span around one multistep call.
    pub fn multistep(active_requests: usize) -> Span {
        info_span!(
            "multistep",
            active_requests,
            micro_steps = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
