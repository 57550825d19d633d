//! Error types for dbop.
//!
//! Only terminal outcomes cross the engine boundary. Every classification and
//! rollback decision is made inside the attempt loop; what the caller sees is
//! one of the variants of [`ExecuteError`] (or a successful value).
//!
//! # Error Categories
//!
//! - **Fatal**: the failure was outside `retry_on` or the classifier rejected it
//! - **Exhausted**: every failure was retryable but the attempt budget ran out
//! - **RollbackFailed**: the attempt scope could not undo a failed attempt; the
//!   isolation guarantee is broken, so this is never retried and never replaced
//!   by a caller-supplied default
//! - **PolicyError**: a [`RetryPolicy`](crate::RetryPolicy) could not be built
//!
//! # Example Usage
//!
//! ```rust,ignore
//! match executor.execute(|| insert_order(&session, &order)).await {
//!     Ok(id) => id,
//!     Err(ExecuteError::RollbackFailed { source, .. }) => {
//!         // The connection may hold residue from the failed attempt.
//!         session.discard();
//!         return Err(source.into());
//!     }
//!     Err(other) => return Err(other.into()),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Why a single attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure<E> {
    /// The operation, the pre-attempt hook, or a scope transition returned an error.
    #[error("{0}")]
    Operation(E),

    /// The attempt did not finish within the per-attempt timeout.
    #[error("attempt timed out after {limit:?}")]
    TimedOut {
        /// The per-attempt limit that was exceeded.
        limit: Duration,
    },
}

impl<E> AttemptFailure<E> {
    /// The operation error, if this failure carries one.
    pub const fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::TimedOut { .. } => None,
        }
    }

    /// Consumes the failure, returning the operation error if there is one.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::TimedOut { .. } => None,
        }
    }

    /// Whether the attempt was cut short by the per-attempt timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Terminal failure of an [`Executor::execute`](crate::Executor::execute) call.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// The failure was not eligible for retry; no further attempts were made.
    #[error("non-retryable failure on attempt {attempt}: {failure}")]
    Fatal {
        /// 1-based index of the attempt that failed.
        attempt: u32,
        /// The captured failure.
        #[source]
        failure: AttemptFailure<E>,
    },

    /// Every failure was retryable, but the attempt budget was consumed.
    #[error("retries exhausted after {attempts} attempts: {failure}")]
    Exhausted {
        /// Total number of attempts made.
        attempts: u32,
        /// The failure of the last attempt.
        #[source]
        failure: AttemptFailure<E>,
    },

    /// The attempt scope failed to roll back a failed attempt.
    ///
    /// This is more severe than the failure that triggered the rollback: the
    /// attempt may have left partial side effects behind.
    #[error("attempt scope rollback failed on attempt {attempt}: {source}")]
    RollbackFailed {
        /// 1-based index of the attempt whose rollback failed.
        attempt: u32,
        /// The error returned by the rollback.
        source: E,
        /// The failure that triggered the rollback.
        failure: AttemptFailure<E>,
    },
}

impl<E> ExecuteError<E> {
    /// Number of attempts made before the call terminated.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempt, .. } | Self::RollbackFailed { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The last captured attempt failure.
    pub const fn failure(&self) -> &AttemptFailure<E> {
        match self {
            Self::Fatal { failure, .. }
            | Self::Exhausted { failure, .. }
            | Self::RollbackFailed { failure, .. } => failure,
        }
    }

    /// Whether the isolation guarantee was violated by a failed rollback.
    pub const fn is_rollback_failure(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Whether the last attempt ended in a timeout.
    pub const fn is_timeout(&self) -> bool {
        self.failure().is_timeout()
    }

    /// Consumes the error and returns the most severe underlying operation error.
    ///
    /// For [`ExecuteError::RollbackFailed`] that is the rollback error; otherwise
    /// it is the error of the last attempt, or `None` if that attempt timed out.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::RollbackFailed { source, .. } => Some(source),
            Self::Fatal { failure, .. } | Self::Exhausted { failure, .. } => {
                failure.into_operation_error()
            }
        }
    }
}

/// Errors raised while validating a [`RetryPolicy`](crate::RetryPolicy).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// `initial_delay` must be strictly positive.
    #[error("initial delay must be positive")]
    ZeroInitialDelay,

    /// `max_delay` must be strictly positive.
    #[error("max delay must be positive")]
    ZeroMaxDelay,

    /// `initial_delay` exceeds `max_delay`.
    #[error("initial delay {initial:?} exceeds max delay {max:?}")]
    InitialExceedsMax {
        /// The configured initial delay.
        initial: Duration,
        /// The configured cap.
        max: Duration,
    },

    /// The backoff multiplier was not a finite number greater than 1.
    #[error("backoff multiplier must be a finite number greater than 1, got {0}")]
    InvalidMultiplier(String),
}

/// Convenient result alias for engine calls.
pub type ExecuteResult<T, E> = Result<T, ExecuteError<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    #[error("deadlock detected")]
    struct Deadlock;

    #[test]
    fn attempts_reports_the_terminal_attempt() {
        let fatal = ExecuteError::Fatal {
            attempt: 1,
            failure: AttemptFailure::Operation(Deadlock),
        };
        let exhausted = ExecuteError::Exhausted {
            attempts: 4,
            failure: AttemptFailure::<Deadlock>::TimedOut {
                limit: Duration::from_millis(50),
            },
        };

        assert_eq!(fatal.attempts(), 1);
        assert_eq!(exhausted.attempts(), 4);
        assert!(exhausted.is_timeout());
        assert!(!fatal.is_timeout());
    }

    #[test]
    fn rollback_failure_prefers_the_rollback_error() {
        #[derive(Debug, PartialEq, Eq, Error)]
        enum DbError {
            #[error("deadlock")]
            Deadlock,
            #[error("rollback refused")]
            RollbackRefused,
        }

        let error = ExecuteError::RollbackFailed {
            attempt: 2,
            source: DbError::RollbackRefused,
            failure: AttemptFailure::Operation(DbError::Deadlock),
        };

        assert!(error.is_rollback_failure());
        assert_eq!(error.failure().operation_error(), Some(&DbError::Deadlock));
        assert_eq!(error.into_source(), Some(DbError::RollbackRefused));
    }

    #[test]
    fn display_messages_are_stable() {
        let fatal = ExecuteError::Fatal {
            attempt: 1,
            failure: AttemptFailure::Operation(Deadlock),
        };
        let timed_out = ExecuteError::<Deadlock>::Exhausted {
            attempts: 3,
            failure: AttemptFailure::TimedOut {
                limit: Duration::from_millis(250),
            },
        };

        insta::assert_snapshot!(fatal.to_string(), @"non-retryable failure on attempt 1: deadlock detected");
        insta::assert_snapshot!(timed_out.to_string(), @"retries exhausted after 3 attempts: attempt timed out after 250ms");
    }

    #[test]
    fn source_chain_points_at_the_attempt_failure() {
        use std::error::Error as _;

        let error = ExecuteError::Exhausted {
            attempts: 2,
            failure: AttemptFailure::Operation(Deadlock),
        };

        let source = error.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("deadlock detected"));
    }
}
