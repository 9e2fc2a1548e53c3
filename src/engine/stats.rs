//! In-process reconciliation and draft-loop counters.

use std::time::Duration;

use serde::Serialize;

use super::candidates::UpdateRequestResult;

/// Running totals for one pipeline.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    /// Reconciliations applied (update and seed).
    pub total_reconciliations: u64,
    /// Tokens rolled back across all reconciliations.
    pub total_removed: u64,
    /// Tokens committed across all reconciliations.
    pub total_inserted: u64,
    /// Draft micro-steps executed.
    pub total_micro_steps: u64,
    /// Completed multistep calls.
    pub total_multisteps: u64,
    /// Total time spent in draft steps.
    pub draft_time_ns: u64,
}

impl SyncStats {
    pub fn record_reconciliation(&mut self, result: &UpdateRequestResult) {
        self.total_reconciliations += 1;
        self.total_removed += result.removed_tokens as u64;
        self.total_inserted += result.inserted_tokens as u64;
    }

    pub fn record_micro_step(&mut self, elapsed: Duration) {
        self.total_micro_steps += 1;
        self.draft_time_ns = self.draft_time_ns.saturating_add(elapsed.as_nanos() as u64);
    }

    pub fn record_multistep(&mut self) {
        self.total_multisteps += 1;
    }

    /// Share of reconciled tokens that were committed rather than rolled back.
    pub fn retention_rate(&self) -> f64 {
        let touched = self.total_inserted + self.total_removed;
        if touched == 0 {
            return 0.0;
        }
        self.total_inserted as f64 / touched as f64
    }

    /// Average micro-steps per multistep call.
    pub fn avg_steps_per_multistep(&self) -> f64 {
        if self.total_multisteps == 0 {
            return 0.0;
        }
        self.total_micro_steps as f64 / self.total_multisteps as f64
    }

    /// Average draft step duration.
    pub fn avg_draft_step(&self) -> Duration {
        if self.total_micro_steps == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.draft_time_ns / self.total_micro_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_have_zero_rates() {
        let stats = SyncStats::default();
        assert_eq!(stats.retention_rate(), 0.0);
        assert_eq!(stats.avg_steps_per_multistep(), 0.0);
        assert_eq!(stats.avg_draft_step(), Duration::ZERO);
    }

    #[test]
    fn rates_follow_totals() {
        let mut stats = SyncStats::default();
        stats.record_reconciliation(&UpdateRequestResult::new(1, 3));
        stats.record_reconciliation(&UpdateRequestResult::new(0, 0));
        for _ in 0..6 {
            stats.record_micro_step(Duration::from_millis(2));
        }
        stats.record_multistep();
        stats.record_multistep();

        assert_eq!(stats.total_reconciliations, 2);
        assert!((stats.retention_rate() - 0.75).abs() < 1e-9);
        assert!((stats.avg_steps_per_multistep() - 3.0).abs() < 1e-9);
        assert_eq!(stats.avg_draft_step(), Duration::from_millis(2));
    }
}
