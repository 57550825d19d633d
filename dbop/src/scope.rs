//! Attempt scope protocol.
//!
//! An attempt scope brackets the side effects of exactly one attempt. The
//! engine asks a factory for a fresh scope at the start of every attempt,
//! enters it, runs the pre-attempt hook and the operation, and then either
//! commits (success) or rolls back (any failure). Scopes never outlive the
//! attempt that created them.
//!
//! Two flavors exist, matching the two execution styles:
//!
//! - [`AttemptScope`] / [`ScopeFactory`] for [`Executor`](crate::Executor),
//!   whose transitions may suspend on I/O;
//! - [`BlockingAttemptScope`] / [`BlockingScopeFactory`] for
//!   [`BlockingExecutor`](crate::BlockingExecutor), whose transitions run to
//!   completion on the calling thread.
//!
//! A rollback that returns an error is terminal: the engine surfaces it as
//! [`ExecuteError::RollbackFailed`](crate::ExecuteError::RollbackFailed) and
//! never retries past it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};

pub mod savepoint;

pub use savepoint::{CommitPlan, RollbackPlan, SavepointState};

/// Isolation unit for one attempt whose transitions may suspend.
#[async_trait]
pub trait AttemptScope<E>: Send {
    /// Establishes isolation, e.g. begins a transaction or sets a savepoint.
    async fn enter(&mut self) -> Result<(), E>;

    /// Makes the attempt's effects durable. Read-only scopes simply release.
    async fn commit(&mut self) -> Result<(), E>;

    /// Undoes every attempt-local effect.
    async fn rollback(&mut self) -> Result<(), E>;
}

/// Produces one [`AttemptScope`] per attempt.
///
/// Any `Fn(bool) -> Box<dyn AttemptScope<E>>` closure is a factory; the
/// argument is the executor's `read_only` flag.
pub trait ScopeFactory<E>: Send + Sync {
    /// Creates a fresh, not yet entered scope.
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>>;
}

impl<E, F> ScopeFactory<E> for F
where
    F: Fn(bool) -> Box<dyn AttemptScope<E>> + Send + Sync,
{
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        self(read_only)
    }
}

/// Isolation unit for one attempt whose transitions run on the calling thread.
pub trait BlockingAttemptScope<E>: Send {
    /// Establishes isolation.
    fn enter(&mut self) -> Result<(), E>;

    /// Makes the attempt's effects durable.
    fn commit(&mut self) -> Result<(), E>;

    /// Undoes every attempt-local effect.
    fn rollback(&mut self) -> Result<(), E>;
}

/// Produces one [`BlockingAttemptScope`] per attempt.
pub trait BlockingScopeFactory<E>: Send + Sync {
    /// Creates a fresh, not yet entered scope.
    fn create(&self, read_only: bool) -> Box<dyn BlockingAttemptScope<E>>;
}

impl<E, F> BlockingScopeFactory<E> for F
where
    F: Fn(bool) -> Box<dyn BlockingAttemptScope<E>> + Send + Sync,
{
    fn create(&self, read_only: bool) -> Box<dyn BlockingAttemptScope<E>> {
        self(read_only)
    }
}

/// Per-attempt setup that runs inside the scope, right before the operation.
///
/// Any `Fn() -> impl Future<Output = Result<(), E>>` closure whose future is
/// `Send + 'static` is a hook. A hook failure is classified exactly like an
/// operation failure.
pub trait PreAttempt<E>: Send + Sync {
    /// Runs the hook for the current attempt.
    fn run(&self) -> BoxFuture<'_, Result<(), E>>;
}

impl<E, F, Fut> PreAttempt<E> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    fn run(&self) -> BoxFuture<'_, Result<(), E>> {
        Box::pin(self())
    }
}

/// Direct-call counterpart of [`PreAttempt`].
pub trait BlockingPreAttempt<E>: Send + Sync {
    /// Runs the hook for the current attempt.
    fn run(&self) -> Result<(), E>;
}

impl<E, F> BlockingPreAttempt<E> for F
where
    F: Fn() -> Result<(), E> + Send + Sync,
{
    fn run(&self) -> Result<(), E> {
        self()
    }
}

/// Presents a blocking factory to the attempt loop.
pub(crate) struct DirectScopes<E>(pub(crate) Arc<dyn BlockingScopeFactory<E>>);

impl<E: Send + 'static> ScopeFactory<E> for DirectScopes<E> {
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        Box::new(DirectScope(self.0.create(read_only)))
    }
}

struct DirectScope<E>(Box<dyn BlockingAttemptScope<E>>);

#[async_trait]
impl<E: Send + 'static> AttemptScope<E> for DirectScope<E> {
    async fn enter(&mut self) -> Result<(), E> {
        self.0.enter()
    }

    async fn commit(&mut self) -> Result<(), E> {
        self.0.commit()
    }

    async fn rollback(&mut self) -> Result<(), E> {
        self.0.rollback()
    }
}

/// Presents a blocking hook to the attempt loop.
pub(crate) struct DirectHook<E>(pub(crate) Arc<dyn BlockingPreAttempt<E>>);

impl<E: Send + 'static> PreAttempt<E> for DirectHook<E> {
    fn run(&self) -> BoxFuture<'_, Result<(), E>> {
        Box::pin(future::ready(self.0.run()))
    }
}
