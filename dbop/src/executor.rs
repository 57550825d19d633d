//! Execution engine front-ends.
//!
//! [`Executor`] runs operations whose attempts suspend on I/O and requires a
//! tokio runtime for its timers. [`BlockingExecutor`] runs operations that
//! execute to completion on the calling thread and needs no runtime at all.
//! Both share one attempt loop, so for the same configuration and the same
//! sequence of failures they make the same number of attempts and reach the
//! same terminal state.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbop::{DefaultClassifier, Executor, RetryPolicy};
//!
//! let executor = Executor::new()
//!     .with_policy(RetryPolicy::builder().max_retries(3).build()?)
//!     .with_classifier(DefaultClassifier::new())
//!     .with_attempt_scope(session.attempt_scopes())
//!     .with_operation_name("transfer_funds");
//!
//! let receipt = executor.execute(|| transfer(&session, from, to, amount)).await?;
//! ```

mod engine;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use self::engine::{Pacing, Settings};
use crate::classify::{RetryOn, TransientClassifier};
use crate::errors::ExecuteError;
use crate::monitoring::ExecutionObserver;
use crate::policy::RetryPolicy;
use crate::scope::{
    BlockingPreAttempt, BlockingScopeFactory, DirectHook, DirectScopes, PreAttempt, ScopeFactory,
};

/// Marker for executors whose attempts may suspend.
#[derive(Debug, Clone, Copy)]
pub enum Suspending {}

/// Marker for executors whose attempts run on the calling thread.
#[derive(Debug, Clone, Copy)]
pub enum Blocking {}

/// Executor for operations that run to completion on the calling thread.
pub type BlockingExecutor<E> = Executor<E, Blocking>;

/// Runs one logical database operation with bounded retries.
///
/// An executor is immutable once built and can be shared by any number of
/// concurrent calls; every call runs its own independent attempt loop.
pub struct Executor<E, S = Suspending> {
    settings: Settings<E>,
    style: PhantomData<fn() -> S>,
}

impl<E, S> Clone for Executor<E, S> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            style: PhantomData,
        }
    }
}

impl<E, S> fmt::Debug for Executor<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("settings", &self.settings)
            .finish()
    }
}

impl<E, S> Default for Executor<E, S> {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            style: PhantomData,
        }
    }
}

impl<E> Executor<E, Suspending> {
    /// Creates a suspending executor with the default policy, retrying every error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a direct-call executor with the default policy, retrying every error.
    pub fn blocking() -> BlockingExecutor<E> {
        BlockingExecutor::default()
    }
}

impl<E, S> Executor<E, S> {
    /// Sets the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.settings.policy = policy;
        self
    }

    /// Sets which failures are eligible for retry.
    #[must_use]
    pub fn retry_on(mut self, retry_on: RetryOn<E>) -> Self {
        self.settings.retry_on = retry_on;
        self
    }

    /// Sets the classifier that decides on eligible failures.
    #[must_use]
    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: TransientClassifier<E> + 'static,
    {
        self.settings.classifier = Some(Arc::new(classifier));
        self
    }

    /// Requests read-only attempt scopes.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.settings.read_only = read_only;
        self
    }

    /// Bounds the wall-clock duration of every attempt.
    #[must_use]
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.settings.attempt_timeout = Some(limit);
        self
    }

    /// Names the operation in logs, spans and observer callbacks.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = Some(name.into());
        self
    }

    /// Registers an observer for every call made through this executor.
    #[must_use]
    pub fn with_observer<O>(self, observer: O) -> Self
    where
        O: ExecutionObserver + 'static,
    {
        self.with_shared_observer(Arc::new(observer))
    }

    /// Registers an observer that is shared with other executors.
    #[must_use]
    pub fn with_shared_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.settings.observers.push(observer);
        self
    }

    /// The retry policy in effect.
    pub const fn policy(&self) -> &RetryPolicy {
        &self.settings.policy
    }

    /// Whether attempt scopes are requested read-only.
    pub const fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    /// The per-attempt time limit, if any.
    pub const fn attempt_timeout(&self) -> Option<Duration> {
        self.settings.attempt_timeout
    }

    /// The configured operation name, if any.
    pub fn operation_name(&self) -> Option<&str> {
        self.settings.name.as_deref()
    }
}

impl<E: fmt::Display + Send + 'static> Executor<E, Suspending> {
    /// Brackets every attempt with a scope from `factory`.
    #[must_use]
    pub fn with_attempt_scope<F>(mut self, factory: F) -> Self
    where
        F: ScopeFactory<E> + 'static,
    {
        self.settings.scopes = Some(Arc::new(factory));
        self
    }

    /// Runs `hook` inside the scope before every invocation of the operation.
    #[must_use]
    pub fn with_pre_attempt<H>(mut self, hook: H) -> Self
    where
        H: PreAttempt<E> + 'static,
    {
        self.settings.pre_attempt = Some(Arc::new(hook));
        self
    }

    /// Runs `operation` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// `operation` is invoked once per attempt and must be safe to invoke
    /// again after a rolled-back failure.
    ///
    /// Dropping the returned future while an attempt scope is open rolls the
    /// scope back in a task on the ambient tokio runtime. That rollback may
    /// still be running when the drop returns; the next `execute` on this
    /// executor (or a clone) waits for it before entering a scope, and
    /// [`settle`](Self::settle) waits for it explicitly.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ExecuteError`]: a fatal failure, exhaustion of
    /// the attempt budget, or a failed rollback.
    pub async fn execute<T, Op, Fut>(&self, operation: Op) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        engine::execute(&self.settings, Pacing::Suspending, operation).await
    }

    /// Waits for the rollbacks of cancelled calls to finish.
    pub async fn settle(&self) {
        self.settings.pending.settle().await;
    }

    /// Like [`execute`](Self::execute), but yields `default` instead of a fatal
    /// or exhausted failure.
    ///
    /// # Errors
    ///
    /// A failed rollback is still returned as
    /// [`ExecuteError::RollbackFailed`]; a default value must never hide a
    /// broken isolation guarantee.
    pub async fn execute_or<T, Op, Fut>(&self, operation: Op, default: T) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        substitute_default(self.execute(operation).await, default)
    }
}

impl<E: fmt::Display + Send + 'static> Executor<E, Blocking> {
    /// Brackets every attempt with a scope from `factory`.
    #[must_use]
    pub fn with_attempt_scope<F>(mut self, factory: F) -> Self
    where
        F: BlockingScopeFactory<E> + 'static,
    {
        self.settings.scopes = Some(Arc::new(DirectScopes(Arc::new(factory))));
        self
    }

    /// Runs `hook` inside the scope before every invocation of the operation.
    #[must_use]
    pub fn with_pre_attempt<H>(mut self, hook: H) -> Self
    where
        H: BlockingPreAttempt<E> + 'static,
    {
        self.settings.pre_attempt = Some(Arc::new(DirectHook(Arc::new(hook))));
        self
    }

    /// Runs `operation` on the calling thread until it succeeds, fails
    /// fatally, or the budget is spent.
    ///
    /// Backoff blocks the calling thread. An attempt that returns after the
    /// per-attempt limit is recorded as timed out and rolled back.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ExecuteError`].
    pub fn execute<T, Op>(&self, mut operation: Op) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Result<T, E>,
    {
        futures::executor::block_on(engine::execute(&self.settings, Pacing::Direct, || {
            std::future::ready(operation())
        }))
    }

    /// Like [`execute`](Self::execute), but yields `default` instead of a fatal
    /// or exhausted failure.
    ///
    /// # Errors
    ///
    /// A failed rollback is still returned as [`ExecuteError::RollbackFailed`].
    pub fn execute_or<T, Op>(&self, operation: Op, default: T) -> Result<T, ExecuteError<E>>
    where
        Op: FnMut() -> Result<T, E>,
    {
        substitute_default(self.execute(operation), default)
    }
}

fn substitute_default<T, E: fmt::Display>(
    result: Result<T, ExecuteError<E>>,
    default: T,
) -> Result<T, ExecuteError<E>> {
    match result {
        Ok(value) => Ok(value),
        Err(error @ ExecuteError::RollbackFailed { .. }) => Err(error),
        Err(error) => {
            debug!(
                attempts = error.attempts(),
                error = %error,
                "Operation failed; returning default value"
            );
            Ok(default)
        }
    }
}

/// Runs `operation` with the default policy and every error eligible for retry.
///
/// Requires a tokio runtime.
///
/// # Errors
///
/// Returns the terminal [`ExecuteError`].
pub async fn execute<T, E, Op, Fut>(operation: Op) -> Result<T, ExecuteError<E>>
where
    E: fmt::Display + Send + 'static,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    Executor::<E>::new().execute(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DefaultClassifier;
    use crate::{ErrorInfo, Jitter};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .jitter(Jitter::None)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn default_executor_returns_the_first_success() {
        let executor = Executor::<ErrorInfo>::new();

        let value = assert_ok!(executor.execute(|| async { Ok(7) }).await);

        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn free_function_retries_with_defaults() {
        let calls = AtomicU32::new(0);

        let result = execute(|| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(ErrorInfo::new("deadlock detected"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(assert_ok!(result), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn execute_or_substitutes_the_default_on_fatal_failure() {
        let executor = Executor::<ErrorInfo>::new()
            .with_policy(RetryPolicy::no_retries())
            .with_classifier(DefaultClassifier::new());

        let value = executor
            .execute_or(|| async { Err(ErrorInfo::new("syntax error")) }, -1)
            .await;

        assert_eq!(assert_ok!(value), -1);
    }

    #[test]
    fn blocking_executor_matches_suspending_semantics() {
        let executor = Executor::<ErrorInfo>::blocking()
            .with_policy(fast_policy(2))
            .with_classifier(DefaultClassifier::new());
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = executor.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ErrorInfo::new("database is locked"))
        });

        let error = assert_err!(result);
        assert!(matches!(error, ExecuteError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn blocking_pre_attempt_failures_are_classified() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hook_calls);
        let executor = Executor::<ErrorInfo>::blocking()
            .with_policy(fast_policy(3))
            .with_classifier(DefaultClassifier::new())
            .with_pre_attempt(move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ErrorInfo::new("lock wait timeout exceeded").with_errno(1205))
                } else {
                    Ok(())
                }
            });
        let op_calls = AtomicU32::new(0);

        let result = executor.execute(|| {
            op_calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ErrorInfo>("ok")
        });

        assert_eq!(assert_ok!(result), "ok");
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
        assert_eq!(op_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn builder_accessors_reflect_configuration() {
        let executor = Executor::<ErrorInfo>::new()
            .read_only(true)
            .with_attempt_timeout(Duration::from_millis(250))
            .with_operation_name("load_profile");

        assert!(executor.is_read_only());
        assert_eq!(executor.attempt_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(executor.operation_name(), Some("load_profile"));
        assert_eq!(executor.policy(), &RetryPolicy::default());
    }
}
