//! TDD-Light tests for telemetry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::{
    Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use specsync_core::engine::{
    CandidateSet, DraftPipeline, GeneratedSequence, LogitProcessorFactory, SamplingParams,
};
use specsync_core::scheduler::{RequestDirectory, RequestId};
use specsync_core::telemetry::{
    init_metrics, record_micro_step, record_reconciliation, record_request_finished, LogConfig,
    LogError, LogFormat, RequestSpan, SpanExt, MICRO_STEPS_TOTAL, RECONCILIATIONS_TOTAL,
    REQUESTS_FINISHED_TOTAL, TOKENS_INSERTED_TOTAL, TOKENS_REMOVED_TOTAL, DRAFT_STEP_MS,
};
use specsync_core::{SyncConfig, SyncError};
use tracing::Span;

// =============================================================================
// Capturing recorder
// =============================================================================

#[derive(Default)]
struct Samples(Mutex<Vec<f64>>);

impl HistogramFn for Samples {
    fn record(&self, value: f64) {
        self.0.lock().unwrap().push(value);
    }
}

#[derive(Default)]
struct CaptureRecorder {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
    histograms: Mutex<HashMap<String, Arc<Samples>>>,
}

impl CaptureRecorder {
    fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn samples(&self, name: &str) -> usize {
        self.histograms
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, |h| h.0.lock().unwrap().len())
    }
}

impl Recorder for CaptureRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(key.name().to_string()).or_default();
        Counter::from_arc(Arc::clone(counter))
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let mut histograms = self.histograms.lock().unwrap();
        let histogram = histograms.entry(key.name().to_string()).or_default();
        Histogram::from_arc(Arc::clone(histogram))
    }
}

// =============================================================================
// LogConfig Tests
// =============================================================================

#[test]
fn log_config_default_is_json() {
    let config = LogConfig::default();
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, "info");
    assert!(config.output_path.is_none());
}

#[test]
fn log_config_with_output_path() {
    let config = LogConfig {
        format: LogFormat::Json,
        level: "specsync_core=trace".to_string(),
        output_path: Some(PathBuf::from("/tmp/specsync.log")),
    };
    assert_eq!(config.output_path, Some(PathBuf::from("/tmp/specsync.log")));
}

#[test]
fn log_config_deserializes_from_toml() {
    let config: LogConfig = toml::from_str("level = \"debug\"\nformat = \"pretty\"").unwrap();
    assert_eq!(config.format, LogFormat::Pretty);
    assert_eq!(config.level, "debug");
}

#[test]
fn log_error_display() {
    let error = LogError::InvalidFilter("bad filter".to_string());
    assert!(error.to_string().contains("Invalid log filter"));
    assert!(LogError::AlreadyInitialized.to_string().contains("already initialized"));
}

// =============================================================================
// Span Tests
// =============================================================================

#[test]
fn span_ext_records_both_outcomes() {
    let span = Span::none();
    span.record_result(&Ok::<u32, SyncError>(1));
    span.record_result(&Err::<u32, _>(SyncError::NotSpeculative(RequestId(1))));
}

#[test]
fn reconcile_span_creates_without_panic() {
    let span = RequestSpan::reconcile(7, "update");
    let _guard = span.enter();
    span.record("removed_tokens", 2usize);
    span.record("inserted_tokens", 3usize);
}

// =============================================================================
// Metrics Tests
// =============================================================================

#[test]
fn metrics_without_recorder_are_noops() {
    init_metrics();
    init_metrics();
    record_reconciliation(0, 0);
    record_micro_step(std::time::Duration::from_millis(1));
    record_request_finished();
}

#[test]
fn pipeline_reports_through_metrics_facade() {
    let recorder = CaptureRecorder::default();

    metrics::with_local_recorder(&recorder, || {
        let mut p = DraftPipeline::from_config(&SyncConfig::default());
        p.add_request(RequestId(1), vec![1], SamplingParams::with_assistant_tokens(2))
            .unwrap();
        p.pull_awaiting_requests();

        let mut set = CandidateSet::new();
        set.insert(0, GeneratedSequence::from_tokens(&[4, 5, 6]));
        p.update_request(RequestId(1), &set, true).unwrap();

        let mut set = CandidateSet::new();
        set.insert(0, GeneratedSequence::from_tokens(&[4, 9]));
        p.update_request(RequestId(1), &set, true).unwrap();

        p.directory_mut().get_mut(RequestId(1)).unwrap().pause_generation(false);
        let mut draft = |directory: &mut RequestDirectory,
                         _: &mut dyn LogitProcessorFactory|
         -> Result<(), SyncError> {
            for request in directory.iter_mut() {
                if let Some(seq) = request.running_sequences_mut().next() {
                    seq.append_token(1, 0.0);
                }
            }
            Ok(())
        };
        p.multistep(&mut draft).unwrap();
        p.finish_request(RequestId(1));
    });

    assert_eq!(recorder.counter(RECONCILIATIONS_TOTAL), 2);
    assert_eq!(recorder.counter(TOKENS_INSERTED_TOTAL), 4);
    assert_eq!(recorder.counter(TOKENS_REMOVED_TOTAL), 2);
    assert_eq!(recorder.counter(MICRO_STEPS_TOTAL), 2);
    assert_eq!(recorder.samples(DRAFT_STEP_MS), 2);
    assert_eq!(recorder.counter(REQUESTS_FINISHED_TOTAL), 1);
}
