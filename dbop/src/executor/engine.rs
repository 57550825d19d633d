//! The attempt loop.
//!
//! Written once for both execution styles. [`Pacing`] is the only thing that
//! differs between them: how the loop sleeps between attempts and how it
//! bounds a single attempt in time.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument, Span};

use crate::attempt::{
    Attempt, AttemptOutcome, FailureKind, OperationContext, OperationOutcome, OperationReport,
};
use crate::classify::{is_retryable, RetryOn, TransientClassifier};
use crate::errors::{AttemptFailure, ExecuteError};
use crate::monitoring::ExecutionObserver;
use crate::policy::RetryPolicy;
use crate::scope::{AttemptScope, PreAttempt, ScopeFactory};

/// Everything an executor is configured with.
pub(crate) struct Settings<E> {
    pub(crate) policy: RetryPolicy,
    pub(crate) retry_on: RetryOn<E>,
    pub(crate) classifier: Option<Arc<dyn TransientClassifier<E>>>,
    pub(crate) scopes: Option<Arc<dyn ScopeFactory<E>>>,
    pub(crate) pre_attempt: Option<Arc<dyn PreAttempt<E>>>,
    pub(crate) read_only: bool,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) name: Option<String>,
    pub(crate) observers: Vec<Arc<dyn ExecutionObserver>>,
    pub(crate) pending: PendingRollbacks,
}

/// Rollbacks of cancelled attempts still running on the tokio runtime.
///
/// Shared by an executor and its clones. Each suspending call waits for
/// them before its first attempt, so it never races a scope left open by a
/// cancelled sibling.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingRollbacks(Arc<Mutex<Vec<JoinHandle<()>>>>);

impl PendingRollbacks {
    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = self.0.lock();
        pending.retain(|task| !task.is_finished());
        pending.push(handle);
    }

    /// Waits until every tracked rollback has finished.
    pub(crate) async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.0.lock());
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(error) = task.await {
                    error!(error = %error, "Rollback task of a cancelled attempt did not finish");
                }
            }
        }
    }
}

impl<E> Default for Settings<E> {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            retry_on: RetryOn::any(),
            classifier: None,
            scopes: None,
            pre_attempt: None,
            read_only: false,
            attempt_timeout: None,
            name: None,
            observers: Vec::new(),
            pending: PendingRollbacks::default(),
        }
    }
}

impl<E> Clone for Settings<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            retry_on: self.retry_on.clone(),
            classifier: self.classifier.clone(),
            scopes: self.scopes.clone(),
            pre_attempt: self.pre_attempt.clone(),
            read_only: self.read_only,
            attempt_timeout: self.attempt_timeout,
            name: self.name.clone(),
            observers: self.observers.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<E> fmt::Debug for Settings<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("policy", &self.policy)
            .field("retry_on", &self.retry_on)
            .field("classifier", &self.classifier.is_some())
            .field("scopes", &self.scopes.is_some())
            .field("pre_attempt", &self.pre_attempt.is_some())
            .field("read_only", &self.read_only)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("name", &self.name)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// How the loop waits and how it bounds an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pacing {
    /// Cooperative: tokio timers, the attempt future is raced against the limit.
    Suspending,
    /// Calling thread: `thread::sleep`, the limit is checked once the attempt
    /// returns; only a late success is turned into a timeout.
    Direct,
}

impl Pacing {
    async fn sleep(self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        match self {
            Self::Suspending => tokio::time::sleep(delay).await,
            Self::Direct => std::thread::sleep(delay),
        }
    }

    async fn bounded<T, E, F>(self, limit: Option<Duration>, work: F) -> Result<T, AttemptFailure<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(limit) = limit else {
            return work.await.map_err(AttemptFailure::Operation);
        };
        match self {
            Self::Suspending => match tokio::time::timeout(limit, work).await {
                Ok(result) => result.map_err(AttemptFailure::Operation),
                Err(_) => Err(AttemptFailure::TimedOut { limit }),
            },
            Self::Direct => {
                let started = Instant::now();
                match work.await {
                    Ok(_) if started.elapsed() > limit => Err(AttemptFailure::TimedOut { limit }),
                    // a late failure keeps its own error so it is classified as such
                    result => result.map_err(AttemptFailure::Operation),
                }
            }
        }
    }
}

/// Rolls an open scope back if the attempt is abandoned mid-flight.
///
/// Dropping the guard while it still holds a scope means the call was
/// cancelled (or panicked) between `enter` and the scope's exit.
struct ScopeGuard<E: fmt::Display + Send + 'static> {
    scope: Option<Box<dyn AttemptScope<E>>>,
    pacing: Pacing,
    attempt: u32,
    pending: PendingRollbacks,
}

impl<E: fmt::Display + Send + 'static> ScopeGuard<E> {
    fn new(
        scope: Box<dyn AttemptScope<E>>,
        pacing: Pacing,
        attempt: u32,
        pending: PendingRollbacks,
    ) -> Self {
        Self {
            scope: Some(scope),
            pacing,
            attempt,
            pending,
        }
    }

    async fn enter(&mut self) -> Result<(), E> {
        match self.scope.as_mut() {
            Some(scope) => scope.enter().await,
            None => Ok(()),
        }
    }

    async fn commit(&mut self) -> Result<(), E> {
        match self.scope.as_mut() {
            Some(scope) => scope.commit().await,
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> Result<(), E> {
        match self.scope.as_mut() {
            Some(scope) => scope.rollback().await,
            None => Ok(()),
        }
    }

    /// The scope has exited (or never entered); nothing is left to undo.
    fn release(&mut self) {
        self.scope = None;
    }
}

impl<E: fmt::Display + Send + 'static> Drop for ScopeGuard<E> {
    fn drop(&mut self) {
        let Some(mut scope) = self.scope.take() else {
            return;
        };
        let attempt = self.attempt;

        match self.pacing {
            Pacing::Direct => match scope.rollback().now_or_never() {
                Some(Ok(())) => warn!(attempt, "Abandoned attempt rolled back"),
                Some(Err(error)) => {
                    error!(attempt, error = %error, "Rollback of abandoned attempt failed");
                }
                None => error!(attempt, "Rollback of abandoned attempt did not complete"),
            },
            Pacing::Suspending => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    warn!(attempt, "Attempt cancelled with an open scope; rolling back");
                    let task = handle.spawn(async move {
                        if let Err(error) = scope.rollback().await {
                            error!(attempt, error = %error, "Rollback of cancelled attempt failed");
                        }
                    });
                    self.pending.track(task);
                }
                Err(_) => error!(
                    attempt,
                    "Attempt cancelled outside a tokio runtime; its scope was not rolled back"
                ),
            },
        }
    }
}

enum Settled<T, E> {
    Committed(T),
    Failed(AttemptFailure<E>),
    RollbackFailed {
        source: E,
        failure: AttemptFailure<E>,
    },
}

async fn invoke<T, E, Op, Fut>(hook: Option<&dyn PreAttempt<E>>, operation: &mut Op) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if let Some(hook) = hook {
        hook.run().await?;
    }
    operation().await
}

async fn exit_with_rollback<T, E>(
    mut guard: ScopeGuard<E>,
    failure: AttemptFailure<E>,
) -> Settled<T, E>
where
    E: fmt::Display + Send + 'static,
{
    let rolled_back = guard.rollback().await;
    guard.release();
    match rolled_back {
        Ok(()) => Settled::Failed(failure),
        Err(source) => Settled::RollbackFailed { source, failure },
    }
}

async fn run_attempt<T, E, Op, Fut>(
    settings: &Settings<E>,
    pacing: Pacing,
    attempt: u32,
    operation: &mut Op,
) -> Settled<T, E>
where
    E: fmt::Display + Send + 'static,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let hook = settings.pre_attempt.as_deref();
    let limit = settings.attempt_timeout;

    let Some(scopes) = settings.scopes.as_deref() else {
        return match pacing.bounded(limit, invoke(hook, operation)).await {
            Ok(value) => Settled::Committed(value),
            Err(failure) => Settled::Failed(failure),
        };
    };

    let mut guard = ScopeGuard::new(
        scopes.create(settings.read_only),
        pacing,
        attempt,
        settings.pending.clone(),
    );
    if let Err(error) = guard.enter().await {
        guard.release();
        return Settled::Failed(AttemptFailure::Operation(error));
    }

    match pacing.bounded(limit, invoke(hook, operation)).await {
        Ok(value) => match guard.commit().await {
            Ok(()) => {
                guard.release();
                Settled::Committed(value)
            }
            Err(error) => exit_with_rollback(guard, AttemptFailure::Operation(error)).await,
        },
        Err(failure) => exit_with_rollback(guard, failure).await,
    }
}

fn failure_kind<E>(failure: &AttemptFailure<E>) -> FailureKind {
    match failure {
        AttemptFailure::Operation(_) => FailureKind::Error,
        AttemptFailure::TimedOut { .. } => FailureKind::Timeout,
    }
}

fn failed_outcome<E>(failure: &AttemptFailure<E>, retryable: bool) -> AttemptOutcome {
    match (failure, retryable) {
        (AttemptFailure::TimedOut { .. }, _) => AttemptOutcome::Timeout,
        (AttemptFailure::Operation(_), true) => AttemptOutcome::RetryableFailure,
        (AttemptFailure::Operation(_), false) => AttemptOutcome::FatalFailure,
    }
}

struct Run<'a, E> {
    settings: &'a Settings<E>,
    context: OperationContext,
    attempts: Vec<Attempt>,
    started: Instant,
}

impl<E> Run<'_, E> {
    fn attempt_span(&self, attempt: u32) -> Span {
        self.settings
            .observers
            .iter()
            .map(|observer| observer.attempt_span(&self.context, attempt))
            .find(|span| !span.is_none())
            .unwrap_or_else(Span::none)
    }

    fn record(&mut self, span: &Span, attempt: Attempt) {
        span.in_scope(|| {
            for observer in &self.settings.observers {
                observer.on_attempt_end(&self.context, &attempt);
            }
        });
        self.attempts.push(attempt);
    }

    fn finish(self, outcome: OperationOutcome) {
        let report = OperationReport {
            attempts: self.attempts,
            elapsed: self.started.elapsed(),
            outcome,
        };
        for observer in &self.settings.observers {
            observer.on_operation_end(&self.context, &report);
        }
    }
}

/// Runs `operation` under `settings` until it succeeds or a terminal state is reached.
pub(crate) async fn execute<T, E, Op, Fut>(
    settings: &Settings<E>,
    pacing: Pacing,
    mut operation: Op,
) -> Result<T, ExecuteError<E>>
where
    E: fmt::Display + Send + 'static,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if pacing == Pacing::Suspending {
        settings.pending.settle().await;
    }

    let policy = settings.policy;
    let max_attempts = policy.max_attempts();
    let mut run = Run {
        settings,
        context: OperationContext::new(
            settings.name.clone(),
            policy,
            settings.read_only,
            settings.attempt_timeout,
        ),
        attempts: Vec::new(),
        started: Instant::now(),
    };
    for observer in &settings.observers {
        observer.on_operation_start(&run.context);
    }

    let mut attempt = 1;
    loop {
        for observer in &settings.observers {
            observer.on_attempt_start(&run.context, attempt);
        }
        let span = run.attempt_span(attempt);
        let started_at = Utc::now();
        let started = Instant::now();
        span.in_scope(|| {
            debug!(
                operation = run.context.display_name(),
                attempt,
                max_attempts,
                "Starting attempt"
            );
        });

        let settled = run_attempt(settings, pacing, attempt, &mut operation)
            .instrument(span.clone())
            .await;
        let mut record = Attempt {
            index: attempt,
            started_at,
            elapsed: started.elapsed(),
            outcome: AttemptOutcome::Success,
            error: None,
            failure_kind: None,
            delay_before_next: None,
        };

        let failure = match settled {
            Settled::Committed(value) => {
                debug!(
                    operation = run.context.display_name(),
                    attempt, "Attempt succeeded"
                );
                run.record(&span, record);
                run.finish(OperationOutcome::Success);
                return Ok(value);
            }
            Settled::RollbackFailed { source, failure } => {
                error!(
                    operation = run.context.display_name(),
                    attempt,
                    error = %source,
                    original_error = %failure,
                    "Attempt scope rollback failed"
                );
                record.outcome = AttemptOutcome::FatalFailure;
                record.error = Some(source.to_string());
                record.failure_kind = Some(FailureKind::Rollback);
                run.record(&span, record);
                run.finish(OperationOutcome::RollbackFailed);
                return Err(ExecuteError::RollbackFailed {
                    attempt,
                    source,
                    failure,
                });
            }
            Settled::Failed(failure) => failure,
        };

        let retryable = is_retryable(&failure, &settings.retry_on, settings.classifier.as_deref());
        record.outcome = failed_outcome(&failure, retryable);
        record.error = Some(failure.to_string());
        record.failure_kind = Some(failure_kind(&failure));

        if !retryable {
            debug!(
                operation = run.context.display_name(),
                attempt,
                error = %failure,
                "Attempt failed with a non-retryable error"
            );
            run.record(&span, record);
            run.finish(OperationOutcome::Fatal);
            return Err(ExecuteError::Fatal { attempt, failure });
        }

        if attempt >= max_attempts {
            warn!(
                operation = run.context.display_name(),
                attempts = attempt,
                error = %failure,
                "Retries exhausted"
            );
            run.record(&span, record);
            run.finish(OperationOutcome::Exhausted);
            return Err(ExecuteError::Exhausted {
                attempts: attempt,
                failure,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            operation = run.context.display_name(),
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %failure,
            "Retryable failure, retrying after delay"
        );
        record.delay_before_next = Some(delay);
        run.record(&span, record);

        pacing.sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{BlockingAttemptScope, BlockingScopeFactory, DirectScopes};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DbError(&'static str);

    impl fmt::Display for DbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(4))
            .jitter(crate::Jitter::None)
            .build()
            .unwrap()
    }

    fn settings(max_retries: u32) -> Settings<DbError> {
        Settings {
            policy: fast_policy(max_retries),
            ..Settings::default()
        }
    }

    struct Tracked {
        events: Arc<Mutex<Vec<String>>>,
        attempt: u32,
        fail_rollback: bool,
    }

    impl BlockingAttemptScope<DbError> for Tracked {
        fn enter(&mut self) -> Result<(), DbError> {
            self.events.lock().unwrap().push(format!("enter:{}", self.attempt));
            Ok(())
        }

        fn commit(&mut self) -> Result<(), DbError> {
            self.events.lock().unwrap().push(format!("commit:{}", self.attempt));
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), DbError> {
            self.events.lock().unwrap().push(format!("rollback:{}", self.attempt));
            if self.fail_rollback {
                Err(DbError("rollback refused"))
            } else {
                Ok(())
            }
        }
    }

    fn tracked_scopes(
        events: &Arc<Mutex<Vec<String>>>,
        fail_rollback: bool,
    ) -> Arc<dyn ScopeFactory<DbError>> {
        let events = Arc::clone(events);
        let counter = Arc::new(AtomicU32::new(0));
        let factory: Arc<dyn BlockingScopeFactory<DbError>> = Arc::new(
            move |_read_only: bool| -> Box<dyn BlockingAttemptScope<DbError>> {
                Box::new(Tracked {
                    events: Arc::clone(&events),
                    attempt: counter.fetch_add(1, Ordering::SeqCst) + 1,
                    fail_rollback,
                })
            },
        );
        Arc::new(DirectScopes(factory))
    }

    #[tokio::test]
    async fn every_failed_attempt_is_rolled_back_before_the_next_begins() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let settings = Settings {
            scopes: Some(tracked_scopes(&events, false)),
            ..settings(3)
        };
        let calls = AtomicU32::new(0);

        let result = execute(&settings, Pacing::Suspending, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 3 {
                    Err(DbError("deadlock detected"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "enter:1",
                "rollback:1",
                "enter:2",
                "rollback:2",
                "enter:3",
                "commit:3"
            ]
        );
    }

    #[tokio::test]
    async fn rollback_failure_stops_the_loop() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let settings = Settings {
            scopes: Some(tracked_scopes(&events, true)),
            ..settings(5)
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = execute(&settings, Pacing::Suspending, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DbError("deadlock detected")) }
        })
        .await;

        let error = result.unwrap_err();
        assert!(error.is_rollback_failure());
        assert_eq!(error.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            error.failure().operation_error(),
            Some(&DbError("deadlock detected"))
        );
    }

    #[test]
    fn direct_pacing_reports_overlong_attempts_as_timeouts() {
        let settings = Settings {
            attempt_timeout: Some(Duration::from_millis(5)),
            ..settings(2)
        };
        let calls = AtomicU32::new(0);

        let result = futures::executor::block_on(execute(&settings, Pacing::Direct, || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            futures::future::ready(Ok::<_, DbError>(()))
        }));

        let error = result.unwrap_err();
        assert!(matches!(error, ExecuteError::Fatal { attempt: 1, .. }));
        assert!(error.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suspending_pacing_cancels_overlong_attempts() {
        let settings = Settings {
            attempt_timeout: Some(Duration::from_millis(50)),
            retry_on: RetryOn::any().including_timeouts(),
            ..settings(1)
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = execute(&settings, Pacing::Suspending, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;

        let error = result.unwrap_err();
        assert!(matches!(error, ExecuteError::Exhausted { attempts: 2, .. }));
        assert!(error.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_call_rolls_back_the_open_scope() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let settings = Settings {
            scopes: Some(tracked_scopes(&events, false)),
            ..settings(0)
        };

        let call = execute(&settings, Pacing::Suspending, || async {
            futures::future::pending::<Result<(), DbError>>().await
        });
        let outcome = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(outcome.is_err());

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*events.lock().unwrap(), vec!["enter:1", "rollback:1"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn retries_are_logged_with_their_delay() {
        let settings = settings(1);
        let calls = AtomicU32::new(0);

        let result = execute(&settings, Pacing::Suspending, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(DbError("lock wait timeout exceeded"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(logs_contain("Retryable failure, retrying after delay"));
        assert!(logs_contain("delay_ms=1"));
        assert!(logs_contain("lock wait timeout exceeded"));
    }

    #[tokio::test]
    #[traced_test]
    async fn rollback_failures_are_logged_at_error_level() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let settings = Settings {
            scopes: Some(tracked_scopes(&events, true)),
            ..settings(1)
        };

        let _: Result<(), _> = execute(&settings, Pacing::Suspending, || async {
            Err(DbError("deadlock detected"))
        })
        .await;

        assert!(logs_contain("ERROR"));
        assert!(logs_contain("Attempt scope rollback failed"));
        assert!(logs_contain("rollback refused"));
    }
}
