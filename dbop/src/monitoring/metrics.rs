//! Metrics capability.
//!
//! Three instruments are recorded per executor call:
//!
//! - `dbop_attempts_total`: one increment per attempt, labelled by outcome
//! - `dbop_operations_total`: one increment per call, labelled by outcome
//! - `dbop_operation_duration_seconds`: call duration, backoff included
//!
//! [`MetricsRecorder`] is the seam. [`NoopRecorder`] is the null object used
//! when metrics are disabled; [`InMemoryRecorder`] keeps everything in process
//! for tests and diagnostics. The OTLP-backed recorder lives in
//! `monitoring::opentelemetry` behind the `opentelemetry` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::attempt::{AttemptOutcome, OperationContext, OperationOutcome};

/// Metric name for the attempt counter.
pub const ATTEMPTS_TOTAL: &str = "dbop_attempts_total";
/// Metric name for the operation counter.
pub const OPERATIONS_TOTAL: &str = "dbop_operations_total";
/// Metric name for the operation duration histogram.
pub const OPERATION_DURATION_SECONDS: &str = "dbop_operation_duration_seconds";

const MAX_DURATION_SAMPLES: usize = 1000;

/// Sink for the three dbop instruments.
pub trait MetricsRecorder: Send + Sync {
    /// Counts one finished attempt.
    fn record_attempt(&self, context: &OperationContext, outcome: AttemptOutcome);

    /// Counts one finished call and records its duration.
    fn record_operation(
        &self,
        context: &OperationContext,
        outcome: OperationOutcome,
        elapsed: Duration,
    );
}

/// Recorder that drops every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_attempt(&self, _context: &OperationContext, _outcome: AttemptOutcome) {}

    fn record_operation(
        &self,
        _context: &OperationContext,
        _outcome: OperationOutcome,
        _elapsed: Duration,
    ) {
    }
}

#[derive(Debug, Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-process recorder with per-outcome counters and bounded duration samples.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    attempts: RwLock<HashMap<AttemptOutcome, Counter>>,
    operations: RwLock<HashMap<OperationOutcome, Counter>>,
    durations: RwLock<Vec<Duration>>,
}

impl InMemoryRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values of every instrument.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let attempts = self
            .attempts
            .read()
            .map(|counters| counters.iter().map(|(k, v)| (*k, v.get())).collect())
            .unwrap_or_default();
        let operations = self
            .operations
            .read()
            .map(|counters| counters.iter().map(|(k, v)| (*k, v.get())).collect())
            .unwrap_or_default();
        let durations = self
            .durations
            .read()
            .map(|samples| samples.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            attempts,
            operations,
            durations,
        }
    }

    fn increment<K>(map: &RwLock<HashMap<K, Counter>>, key: K)
    where
        K: std::hash::Hash + Eq,
    {
        if let Ok(counters) = map.read() {
            if let Some(counter) = counters.get(&key) {
                counter.increment();
                return;
            }
        }
        if let Ok(mut counters) = map.write() {
            counters.entry(key).or_default().increment();
        }
    }
}

impl MetricsRecorder for InMemoryRecorder {
    fn record_attempt(&self, _context: &OperationContext, outcome: AttemptOutcome) {
        Self::increment(&self.attempts, outcome);
    }

    fn record_operation(
        &self,
        _context: &OperationContext,
        outcome: OperationOutcome,
        elapsed: Duration,
    ) {
        Self::increment(&self.operations, outcome);
        if let Ok(mut samples) = self.durations.write() {
            samples.push(elapsed);
            if samples.len() > MAX_DURATION_SAMPLES {
                let excess = samples.len() - MAX_DURATION_SAMPLES;
                samples.drain(0..excess);
            }
        }
    }
}

/// Point-in-time copy of an [`InMemoryRecorder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// `dbop_attempts_total` by outcome.
    pub attempts: HashMap<AttemptOutcome, u64>,
    /// `dbop_operations_total` by outcome.
    pub operations: HashMap<OperationOutcome, u64>,
    /// `dbop_operation_duration_seconds` samples, oldest first.
    pub durations: Vec<Duration>,
}

impl MetricsSnapshot {
    /// Sum of all attempt counters.
    pub fn total_attempts(&self) -> u64 {
        self.attempts.values().sum()
    }

    /// Sum of all operation counters.
    pub fn total_operations(&self) -> u64 {
        self.operations.values().sum()
    }

    /// Attempts that ended with `outcome`.
    pub fn attempts_with(&self, outcome: AttemptOutcome) -> u64 {
        self.attempts.get(&outcome).copied().unwrap_or(0)
    }

    /// Calls that ended with `outcome`.
    pub fn operations_with(&self, outcome: OperationOutcome) -> u64 {
        self.operations.get(&outcome).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetryPolicy;

    fn context() -> OperationContext {
        OperationContext::new(None, RetryPolicy::default(), false, None)
    }

    #[test]
    fn counts_attempts_and_operations_by_outcome() {
        let recorder = InMemoryRecorder::new();
        let ctx = context();

        recorder.record_attempt(&ctx, AttemptOutcome::RetryableFailure);
        recorder.record_attempt(&ctx, AttemptOutcome::RetryableFailure);
        recorder.record_attempt(&ctx, AttemptOutcome::Success);
        recorder.record_operation(&ctx, OperationOutcome::Success, Duration::from_millis(12));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_attempts(), 3);
        assert_eq!(snapshot.attempts_with(AttemptOutcome::RetryableFailure), 2);
        assert_eq!(snapshot.operations_with(OperationOutcome::Success), 1);
        assert_eq!(snapshot.operations_with(OperationOutcome::Fatal), 0);
        assert_eq!(snapshot.durations, vec![Duration::from_millis(12)]);
    }

    #[test]
    fn duration_samples_are_bounded() {
        let recorder = InMemoryRecorder::new();
        let ctx = context();

        for millis in 0..1_200u64 {
            recorder.record_operation(
                &ctx,
                OperationOutcome::Exhausted,
                Duration::from_millis(millis),
            );
        }

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.durations.len(), MAX_DURATION_SAMPLES);
        assert_eq!(snapshot.durations[0], Duration::from_millis(200));
        assert_eq!(snapshot.total_operations(), 1_200);
    }
}
