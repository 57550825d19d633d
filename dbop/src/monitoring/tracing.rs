//! Tracing decorator for executors.
//!
//! [`Traced`] wraps an [`Executor`] by composition. Per call it opens one
//! `dbop.operation` span; per attempt the engine runs inside a `dbop.attempt`
//! child span. The three metrics from [`metrics`](super::metrics) are fed
//! from the same observations.
//!
//! The decorator never changes what the wrapped executor does. With
//! telemetry disabled it forwards every call untouched.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::field::Empty;
use tracing::{info_span, Instrument, Span};

use super::config::TelemetryConfig;
use super::metrics::{MetricsRecorder, NoopRecorder};
use super::ExecutionObserver;
use crate::attempt::{Attempt, OperationContext, OperationReport};
use crate::errors::ExecuteError;
use crate::executor::{Blocking, Executor, Suspending};

/// Database identification attached to the `dbop.operation` span.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DbAttributes {
    system: Option<String>,
    name: Option<String>,
    user: Option<String>,
    statement: Option<String>,
}

/// Observer that opens attempt spans and feeds the metrics recorder.
struct SpanObserver {
    recorder: Arc<dyn MetricsRecorder>,
}

impl ExecutionObserver for SpanObserver {
    fn attempt_span(&self, context: &OperationContext, attempt: u32) -> Span {
        info_span!(
            "dbop.attempt",
            dbop.operation = context.display_name(),
            dbop.attempt.number = attempt,
            dbop.attempt.outcome = Empty,
            dbop.attempt.error_kind = Empty,
            dbop.attempt.delay_ms = Empty,
        )
    }

    fn on_attempt_end(&self, context: &OperationContext, attempt: &Attempt) {
        let span = Span::current();
        span.record("dbop.attempt.outcome", attempt.outcome.as_str());
        if let Some(kind) = attempt.failure_kind {
            span.record("dbop.attempt.error_kind", kind.as_str());
        }
        if let Some(delay) = attempt.delay_before_next {
            span.record(
                "dbop.attempt.delay_ms",
                u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            );
        }
        self.recorder.record_attempt(context, attempt.outcome);
    }

    fn on_operation_end(&self, context: &OperationContext, report: &OperationReport) {
        let span = Span::current();
        span.record("dbop.outcome", report.outcome.as_str());
        span.record("dbop.attempts", report.attempts.len());
        self.recorder
            .record_operation(context, report.outcome, report.elapsed);
    }
}

/// Executor decorated with spans and metrics.
pub struct Traced<X> {
    inner: X,
    enabled: bool,
    db: DbAttributes,
}

impl<X: fmt::Debug> fmt::Debug for Traced<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Traced")
            .field("inner", &self.inner)
            .field("enabled", &self.enabled)
            .field("db", &self.db)
            .finish()
    }
}

impl<E, S> Traced<Executor<E, S>> {
    /// Wraps `executor` according to `config`.
    ///
    /// Metrics go to the OTLP meter when the `opentelemetry` feature is on
    /// and `config` enables them; otherwise they are dropped.
    pub fn new(executor: Executor<E, S>, config: &TelemetryConfig) -> Self {
        let recorder: Arc<dyn MetricsRecorder> = if config.metrics_active() {
            default_recorder()
        } else {
            Arc::new(NoopRecorder)
        };
        Self::with_recorder(executor, config, recorder)
    }

    /// Wraps `executor`, sending metrics to `recorder`.
    pub fn with_recorder(
        executor: Executor<E, S>,
        config: &TelemetryConfig,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Self {
        if !config.enabled {
            return Self::disabled(executor);
        }
        let recorder = if config.metrics_enabled {
            recorder
        } else {
            Arc::new(NoopRecorder)
        };
        Self {
            inner: executor.with_shared_observer(Arc::new(SpanObserver { recorder })),
            enabled: true,
            db: DbAttributes::default(),
        }
    }

    /// Wraps `executor` without emitting anything.
    pub fn disabled(executor: Executor<E, S>) -> Self {
        Self {
            inner: executor,
            enabled: false,
            db: DbAttributes::default(),
        }
    }

    /// Sets the `db.system` attribute, e.g. `postgresql`.
    #[must_use]
    pub fn with_db_system(mut self, system: impl Into<String>) -> Self {
        self.db.system = Some(system.into());
        self
    }

    /// Sets the `db.name` attribute.
    #[must_use]
    pub fn with_db_name(mut self, name: impl Into<String>) -> Self {
        self.db.name = Some(name.into());
        self
    }

    /// Sets the `db.user` attribute.
    #[must_use]
    pub fn with_db_user(mut self, user: impl Into<String>) -> Self {
        self.db.user = Some(user.into());
        self
    }

    /// Sets the `db.statement` attribute.
    #[must_use]
    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.db.statement = Some(statement.into());
        self
    }

    /// Whether spans and metrics are emitted.
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The wrapped executor.
    pub const fn inner(&self) -> &Executor<E, S> {
        &self.inner
    }

    fn operation_span(&self) -> Span {
        if !self.enabled {
            return Span::none();
        }
        let policy = self.inner.policy();
        info_span!(
            "dbop.operation",
            dbop.operation = self.inner.operation_name().unwrap_or("operation"),
            db.system = self.db.system.as_deref(),
            db.name = self.db.name.as_deref(),
            db.user = self.db.user.as_deref(),
            db.statement = self.db.statement.as_deref(),
            dbop.max_retries = policy.max_retries(),
            dbop.initial_delay_ms = millis(policy.initial_delay()),
            dbop.max_delay_ms = millis(policy.max_delay()),
            dbop.jitter = policy.jitter().as_str(),
            dbop.read_only = self.inner.is_read_only(),
            dbop.attempt_timeout_ms = self.inner.attempt_timeout().map(millis),
            dbop.outcome = Empty,
            dbop.attempts = Empty,
        )
    }
}

impl<E: fmt::Display + Send + 'static> Traced<Executor<E, Suspending>> {
    /// Traced counterpart of [`Executor::execute`].
    ///
    /// # Errors
    ///
    /// Exactly the errors the wrapped executor returns.
    pub async fn execute<T, Op, Fut>(&self, operation: Op) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.inner
            .execute(operation)
            .instrument(self.operation_span())
            .await
    }

    /// Traced counterpart of [`Executor::execute_or`].
    ///
    /// # Errors
    ///
    /// Exactly the errors the wrapped executor returns.
    pub async fn execute_or<T, Op, Fut>(&self, operation: Op, default: T) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.inner
            .execute_or(operation, default)
            .instrument(self.operation_span())
            .await
    }
}

impl<E: fmt::Display + Send + 'static> Traced<Executor<E, Blocking>> {
    /// Traced counterpart of the blocking `execute`.
    ///
    /// # Errors
    ///
    /// Exactly the errors the wrapped executor returns.
    pub fn execute<T, Op>(&self, operation: Op) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Result<T, E>,
    {
        self.operation_span()
            .in_scope(|| self.inner.execute(operation))
    }

    /// Traced counterpart of the blocking `execute_or`.
    ///
    /// # Errors
    ///
    /// Exactly the errors the wrapped executor returns.
    pub fn execute_or<T, Op>(&self, operation: Op, default: T) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Result<T, E>,
    {
        self.operation_span()
            .in_scope(|| self.inner.execute_or(operation, default))
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(feature = "opentelemetry")]
fn default_recorder() -> Arc<dyn MetricsRecorder> {
    Arc::new(super::opentelemetry::OtelRecorder::global())
}

#[cfg(not(feature = "opentelemetry"))]
fn default_recorder() -> Arc<dyn MetricsRecorder> {
    Arc::new(NoopRecorder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::{AttemptOutcome, OperationOutcome};
    use crate::classify::ErrorInfo;
    use crate::monitoring::InMemoryRecorder;
    use crate::policy::{Jitter, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn executor() -> Executor<ErrorInfo> {
        Executor::new().with_operation_name("reserve_seat").with_policy(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(2))
                .jitter(Jitter::None)
                .build()
                .unwrap(),
        )
    }

    fn flaky(calls: &AtomicU32) -> impl FnMut() -> std::future::Ready<Result<u32, ErrorInfo>> + '_ {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if call == 1 {
                Err(ErrorInfo::new("deadlock detected"))
            } else {
                Ok(call)
            })
        }
    }

    #[tokio::test]
    async fn records_attempt_and_operation_metrics() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let traced = Traced::with_recorder(
            executor(),
            &TelemetryConfig::enabled(),
            Arc::clone(&recorder) as Arc<dyn MetricsRecorder>,
        );
        let calls = AtomicU32::new(0);

        let value = traced.execute(flaky(&calls)).await.unwrap();

        assert_eq!(value, 2);
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.attempts_with(AttemptOutcome::RetryableFailure), 1);
        assert_eq!(snapshot.attempts_with(AttemptOutcome::Success), 1);
        assert_eq!(snapshot.operations_with(OperationOutcome::Success), 1);
        assert_eq!(snapshot.durations.len(), 1);
    }

    #[tokio::test]
    async fn disabled_decorator_is_a_pass_through() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let traced = Traced::with_recorder(
            executor(),
            &TelemetryConfig::default(),
            Arc::clone(&recorder) as Arc<dyn MetricsRecorder>,
        );
        let calls = AtomicU32::new(0);

        let value = traced.execute(flaky(&calls)).await.unwrap();

        assert!(!traced.is_enabled());
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.snapshot().total_attempts(), 0);
    }

    #[tokio::test]
    async fn metrics_can_be_switched_off_independently() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let traced = Traced::with_recorder(
            executor(),
            &TelemetryConfig::enabled().with_metrics(false),
            Arc::clone(&recorder) as Arc<dyn MetricsRecorder>,
        );
        let calls = AtomicU32::new(0);

        traced.execute(flaky(&calls)).await.unwrap();

        assert!(traced.is_enabled());
        assert_eq!(recorder.snapshot(), Default::default());
    }

    #[tokio::test]
    #[traced_test]
    async fn attempts_run_inside_operation_and_attempt_spans() {
        let traced = Traced::new(executor(), &TelemetryConfig::enabled().with_metrics(false))
            .with_db_system("postgresql")
            .with_db_name("bookings");
        let calls = AtomicU32::new(0);

        traced.execute(flaky(&calls)).await.unwrap();

        assert!(logs_contain("dbop.operation"));
        assert!(logs_contain("db.system=\"postgresql\""));
        assert!(logs_contain("dbop.attempt"));
        assert!(logs_contain("dbop.attempt.number=2"));
    }

    #[test]
    fn blocking_executors_can_be_traced() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let traced = Traced::with_recorder(
            Executor::<ErrorInfo>::blocking().with_policy(RetryPolicy::no_retries()),
            &TelemetryConfig::enabled(),
            Arc::clone(&recorder) as Arc<dyn MetricsRecorder>,
        );

        let value = traced.execute_or(|| Err(ErrorInfo::new("syntax error")), 0);

        assert_eq!(value.unwrap(), 0);
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.operations_with(OperationOutcome::Exhausted), 1);
        assert_eq!(snapshot.attempts_with(AttemptOutcome::RetryableFailure), 1);
        assert_eq!(snapshot.attempts_with(AttemptOutcome::FatalFailure), 0);
    }
}
