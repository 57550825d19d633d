//! `dbop` - Driver-agnostic execution engine for database operations
//!
//! Runs a single logical database operation with bounded, observable retries.
//! The caller decides which failures are worth retrying, how long to back off
//! between attempts, and how each attempt's side effects are isolated; the
//! engine guarantees that at most one attempt's effects survive.
//!
//! # Building blocks
//!
//! - [`RetryPolicy`]: attempt budget and backoff shape, with [`Jitter`]
//! - [`RetryOn`] and [`TransientClassifier`]: which failures are retried
//! - [`AttemptScope`] / [`BlockingAttemptScope`]: commit/rollback per attempt
//! - [`Executor`] / [`BlockingExecutor`]: the attempt loop
//! - [`monitoring`]: observers, the [`Traced`](monitoring::Traced) decorator and metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use dbop::{DefaultClassifier, Executor, RetryPolicy};
//!
//! let executor = Executor::new()
//!     .with_policy(RetryPolicy::builder().max_retries(3).build()?)
//!     .with_classifier(DefaultClassifier::new())
//!     .with_attempt_timeout(Duration::from_secs(2));
//!
//! let rows = executor.execute(|| load_rows(&pool)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attempt;
pub mod classify;
pub mod config;
pub mod errors;
pub mod executor;
pub mod monitoring;
pub mod policy;
pub mod scope;

pub use attempt::{
    Attempt, AttemptOutcome, FailureKind, OperationContext, OperationOutcome, OperationReport,
};
pub use classify::{
    detect_transient, DefaultClassifier, DriverError, ErrorClass, ErrorInfo, RetryOn,
    TransientClassifier, TransientCondition,
};
pub use config::RetryPolicyConfig;
pub use errors::{AttemptFailure, ExecuteError, ExecuteResult, PolicyError};
pub use executor::{execute, Blocking, BlockingExecutor, Executor, Suspending};
pub use monitoring::{ExecutionObserver, NoopObserver};
pub use policy::{Backoff, BackoffMultiplier, Jitter, RetryPolicy, RetryPolicyBuilder};
pub use scope::{
    AttemptScope, BlockingAttemptScope, BlockingPreAttempt, BlockingScopeFactory, CommitPlan,
    PreAttempt, RollbackPlan, SavepointState, ScopeFactory,
};

/// Re-export of `async_trait` for implementing [`AttemptScope`].
pub use async_trait::async_trait;
