//! Per-attempt diagnostics.
//!
//! The engine produces one [`Attempt`] per loop iteration and hands it to the
//! registered [observers](crate::monitoring::ExecutionObserver). Nothing here
//! feeds back into control flow.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::RetryPolicy;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The operation returned a value and the scope committed.
    Success,
    /// The attempt failed with a retryable error. On the last attempt no
    /// retry follows and the operation ends as exhausted.
    RetryableFailure,
    /// The attempt failed with an error that is never retried.
    FatalFailure,
    /// The attempt exceeded the per-attempt timeout.
    Timeout,
}

impl AttemptOutcome {
    /// Lower-case name, used for span attributes and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::FatalFailure => "fatal_failure",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation, the pre-attempt hook or a scope transition returned an error.
    Error,
    /// The per-attempt timeout elapsed.
    Timeout,
    /// The scope failed to roll the attempt back.
    Rollback,
}

impl FailureKind {
    /// Lower-case name, used for span attributes and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Rollback => "rollback",
        }
    }
}

/// Diagnostic record of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt index.
    pub index: u32,
    /// Wall-clock start of the attempt.
    pub started_at: DateTime<Utc>,
    /// Time spent in the attempt, scope transitions included.
    pub elapsed: Duration,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Rendered failure, if the attempt failed.
    pub error: Option<String>,
    /// Category of the failure, if the attempt failed.
    pub failure_kind: Option<FailureKind>,
    /// Backoff slept before the next attempt; only set when a retry follows.
    pub delay_before_next: Option<Duration>,
}

/// Terminal state of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// An attempt succeeded.
    Success,
    /// A failure was not eligible for retry.
    Fatal,
    /// The attempt budget ran out.
    Exhausted,
    /// An attempt scope failed to roll back.
    RollbackFailed,
}

impl OperationOutcome {
    /// Lower-case name, used for span attributes and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fatal => "fatal",
            Self::Exhausted => "exhausted",
            Self::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and parameters of one `execute` call, shared with observers.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    /// Time-ordered identifier of this call.
    pub operation_id: Uuid,
    /// Caller-supplied operation name.
    pub name: Option<String>,
    /// Policy in effect.
    pub policy: RetryPolicy,
    /// Whether attempt scopes were requested read-only.
    pub read_only: bool,
    /// Per-attempt time limit, if any.
    pub attempt_timeout: Option<Duration>,
}

impl OperationContext {
    pub(crate) fn new(
        name: Option<String>,
        policy: RetryPolicy,
        read_only: bool,
        attempt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            operation_id: Uuid::now_v7(),
            name,
            policy,
            read_only,
            attempt_timeout,
        }
    }

    /// The operation name, or `"operation"` when none was given.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("operation")
    }
}

/// Everything that happened during one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    /// Every attempt, in order.
    pub attempts: Vec<Attempt>,
    /// Time spent in the call, backoff included.
    pub elapsed: Duration,
    /// Terminal state.
    pub outcome: OperationOutcome,
}

impl OperationReport {
    /// Total backoff slept between attempts.
    pub fn total_delay(&self) -> Duration {
        self.attempts
            .iter()
            .filter_map(|attempt| attempt.delay_before_next)
            .sum()
    }

    /// The attempt that decided the outcome.
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(index: u32, outcome: AttemptOutcome, delay_ms: Option<u64>) -> Attempt {
        Attempt {
            index,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(1),
            outcome,
            error: None,
            failure_kind: None,
            delay_before_next: delay_ms.map(Duration::from_millis),
        }
    }

    #[test]
    fn total_delay_sums_backoff_between_attempts() {
        let report = OperationReport {
            attempts: vec![
                attempt(1, AttemptOutcome::RetryableFailure, Some(10)),
                attempt(2, AttemptOutcome::RetryableFailure, Some(20)),
                attempt(3, AttemptOutcome::Success, None),
            ],
            elapsed: Duration::from_millis(40),
            outcome: OperationOutcome::Success,
        };

        assert_eq!(report.total_delay(), Duration::from_millis(30));
        assert_eq!(report.last_attempt().map(|a| a.index), Some(3));
    }

    #[test]
    fn contexts_get_fresh_v7_identifiers() {
        let policy = RetryPolicy::default();
        let first = OperationContext::new(None, policy, false, None);
        let second = OperationContext::new(Some("transfer".into()), policy, true, None);

        assert_eq!(first.operation_id.get_version_num(), 7);
        assert_ne!(first.operation_id, second.operation_id);
        assert_eq!(first.display_name(), "operation");
        assert_eq!(second.display_name(), "transfer");
    }

    #[test]
    fn outcomes_serialize_in_snake_case() {
        let json = serde_json::to_string(&AttemptOutcome::RetryableFailure).unwrap();
        assert_eq!(json, "\"retryable_failure\"");
        assert_eq!(OperationOutcome::RollbackFailed.to_string(), "rollback_failed");
    }
}
