//! Transient failure classification.
//!
//! Two independent filters decide whether a failed attempt is retried:
//!
//! 1. [`RetryOn`] is the coarse eligibility set. A failure outside it is fatal
//!    no matter what any classifier says.
//! 2. A [`TransientClassifier`], when supplied, makes the final call for
//!    failures inside the set. Without one, membership in the set is enough.
//!
//! Attempt timeouts are outside the default set. A classifier that answers
//! [`TransientClassifier::is_transient_timeout`] decides on its own; when it
//! has no answer, timeouts are retried only if the set was widened with
//! [`RetryOn::including_timeouts`].
//!
//! [`DefaultClassifier`] recognizes a small cross-backend taxonomy of
//! transient conditions from the normalized view a driver adapter exposes
//! through [`DriverError`].

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::AttemptFailure;

/// Decides whether a failure inside the retry set is worth another attempt.
///
/// Implementations must be pure and total: no side effects, no panics.
/// Any `Fn(&E) -> bool` closure that is `Send + Sync` is a classifier.
pub trait TransientClassifier<E>: Send + Sync {
    /// Whether `error` is expected to resolve on retry.
    fn is_transient(&self, error: &E) -> bool;

    /// Whether an attempt that exceeded `limit` is expected to succeed on retry.
    ///
    /// `None` leaves the decision to [`RetryOn`]. Closure classifiers only
    /// see operation errors and always answer `None`.
    fn is_transient_timeout(&self, limit: Duration) -> Option<bool> {
        let _ = limit;
        None
    }
}

impl<E, F> TransientClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &E) -> bool {
        self(error)
    }
}

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// The set of failures eligible for retry consideration.
///
/// Defaults to every operation error and no timeouts.
pub struct RetryOn<E> {
    predicate: Option<Predicate<E>>,
    admit_errors: bool,
    include_timeouts: bool,
}

impl<E> RetryOn<E> {
    /// Every operation error is eligible; timeouts are not.
    pub const fn any() -> Self {
        Self {
            predicate: None,
            admit_errors: true,
            include_timeouts: false,
        }
    }

    /// Nothing is eligible; every failure is fatal.
    pub const fn nothing() -> Self {
        Self {
            predicate: None,
            admit_errors: false,
            include_timeouts: false,
        }
    }

    /// Only operation errors accepted by `predicate` are eligible.
    pub fn matching<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Arc::new(predicate)),
            admit_errors: true,
            include_timeouts: false,
        }
    }

    /// Also treats attempt timeouts as eligible.
    #[must_use]
    pub fn including_timeouts(mut self) -> Self {
        self.include_timeouts = true;
        self
    }

    /// Whether `error` is inside the set.
    pub fn admits(&self, error: &E) -> bool {
        self.admit_errors && self.predicate.as_ref().map_or(true, |p| p(error))
    }

    /// Whether attempt timeouts are inside the set.
    pub const fn admits_timeouts(&self) -> bool {
        self.include_timeouts
    }
}

impl<E> Default for RetryOn<E> {
    fn default() -> Self {
        Self::any()
    }
}

impl<E> Clone for RetryOn<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            admit_errors: self.admit_errors,
            include_timeouts: self.include_timeouts,
        }
    }
}

impl<E> fmt::Debug for RetryOn<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOn")
            .field("errors", &self.admit_errors)
            .field("filtered", &self.predicate.is_some())
            .field("timeouts", &self.include_timeouts)
            .finish()
    }
}

/// Applies the retry set and the optional classifier to one attempt failure.
pub(crate) fn is_retryable<E>(
    failure: &AttemptFailure<E>,
    retry_on: &RetryOn<E>,
    classifier: Option<&dyn TransientClassifier<E>>,
) -> bool {
    match failure {
        AttemptFailure::Operation(error) => {
            retry_on.admits(error) && classifier.map_or(true, |c| c.is_transient(error))
        }
        AttemptFailure::TimedOut { limit } => {
            let verdict = classifier.and_then(|c| c.is_transient_timeout(*limit));
            verdict.unwrap_or_else(|| retry_on.admits_timeouts())
        }
    }
}

/// Broad category of a driver error, as reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Errors from the database server's operation (locks, deadlocks, resources).
    Operational,
    /// Errors in the client interface or transport.
    Interface,
    /// Client-side timeouts.
    Timeout,
    /// Anything else.
    #[default]
    Other,
}

/// The normalized view of a driver error that classification works on.
pub trait DriverError {
    /// The five-character SQLSTATE, if the backend reported one.
    fn sqlstate(&self) -> Option<&str> {
        None
    }

    /// A numeric vendor error code (MySQL/MariaDB style), if any.
    fn errno(&self) -> Option<i64> {
        None
    }

    /// Human readable message as reported by the backend.
    fn message(&self) -> Cow<'_, str>;

    /// Broad category of the error.
    fn error_class(&self) -> ErrorClass {
        ErrorClass::Other
    }
}

/// An owned [`DriverError`], for adapters that normalize into a plain value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// SQLSTATE code.
    pub sqlstate: Option<String>,
    /// Vendor error number.
    pub errno: Option<i64>,
    /// Backend message.
    pub message: String,
    /// Broad category.
    pub class: ErrorClass,
}

impl ErrorInfo {
    /// An error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Attaches a SQLSTATE code.
    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    /// Attaches a vendor error number.
    #[must_use]
    pub fn with_errno(mut self, errno: i64) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Sets the error class.
    #[must_use]
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = class;
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.sqlstate, self.errno) {
            (Some(code), _) => write!(f, "[{code}] {}", self.message),
            (None, Some(errno)) => write!(f, "({errno}) {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ErrorInfo {}

impl DriverError for ErrorInfo {
    fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }

    fn errno(&self) -> Option<i64> {
        self.errno
    }

    fn message(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.message)
    }

    fn error_class(&self) -> ErrorClass {
        self.class
    }
}

/// Transient conditions recognized across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientCondition {
    /// Two transactions waited on each other.
    Deadlock,
    /// A lock could not be acquired in time, or immediately under NOWAIT.
    LockNotAvailable,
    /// The transaction could not be serialized against concurrent ones.
    SerializationFailure,
    /// The server cancelled a statement that ran too long.
    StatementTimeout,
    /// An embedded database file was locked by another writer.
    DatabaseLocked,
    /// The connection dropped mid-operation.
    ConnectionLost,
    /// A generic operational timeout.
    Timeout,
}

impl TransientCondition {
    /// Lower-case name, used for span attributes and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deadlock => "deadlock",
            Self::LockNotAvailable => "lock_not_available",
            Self::SerializationFailure => "serialization_failure",
            Self::StatementTimeout => "statement_timeout",
            Self::DatabaseLocked => "database_locked",
            Self::ConnectionLost => "connection_lost",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TransientCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PG_DEADLOCK: &str = "40P01";
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
const PG_SERIALIZATION_FAILURE: &str = "40001";

const MYSQL_DEADLOCK: i64 = 1213;
const MYSQL_LOCK_WAIT_TIMEOUT: i64 = 1205;
const MYSQL_NOWAIT: i64 = 3572;
const MYSQL_SERVER_GONE: i64 = 2006;
const MYSQL_LOST_CONNECTION: i64 = 2013;

const GENERIC_TOKENS: [(&str, TransientCondition); 6] = [
    ("timeout", TransientCondition::Timeout),
    ("deadlock", TransientCondition::Deadlock),
    ("lock wait", TransientCondition::LockNotAvailable),
    ("gone away", TransientCondition::ConnectionLost),
    ("lost connection", TransientCondition::ConnectionLost),
    ("connection reset", TransientCondition::ConnectionLost),
];

/// Maps a driver error onto the transient taxonomy.
///
/// Returns `None` for errors that are not known to be transient.
pub fn detect_transient(error: &dyn DriverError) -> Option<TransientCondition> {
    match error.sqlstate() {
        Some(PG_DEADLOCK) => return Some(TransientCondition::Deadlock),
        Some(PG_LOCK_NOT_AVAILABLE) => return Some(TransientCondition::LockNotAvailable),
        Some(PG_SERIALIZATION_FAILURE) => return Some(TransientCondition::SerializationFailure),
        _ => {}
    }

    let message = error.message().to_lowercase();
    if message.contains("canceling statement due to statement timeout") {
        return Some(TransientCondition::StatementTimeout);
    }
    if message.contains("deadlock detected") {
        return Some(TransientCondition::Deadlock);
    }
    if message.contains("canceling statement due to lock timeout") {
        return Some(TransientCondition::LockNotAvailable);
    }

    match error.errno() {
        Some(MYSQL_DEADLOCK) => return Some(TransientCondition::Deadlock),
        Some(MYSQL_LOCK_WAIT_TIMEOUT | MYSQL_NOWAIT) => {
            return Some(TransientCondition::LockNotAvailable);
        }
        Some(MYSQL_SERVER_GONE | MYSQL_LOST_CONNECTION) => {
            return Some(TransientCondition::ConnectionLost);
        }
        _ => {}
    }
    if message.contains("nowait is set") || message.contains("lock wait timeout") {
        return Some(TransientCondition::LockNotAvailable);
    }
    if message.contains("deadlock") {
        return Some(TransientCondition::Deadlock);
    }

    if message.contains("database is locked") {
        return Some(TransientCondition::DatabaseLocked);
    }

    match error.error_class() {
        ErrorClass::Operational | ErrorClass::Interface | ErrorClass::Timeout => GENERIC_TOKENS
            .iter()
            .find(|(token, _)| message.contains(*token))
            .map(|(_, condition)| *condition),
        ErrorClass::Other => None,
    }
}

/// Classifier backed by [`detect_transient`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultClassifier {
    retry_timeouts: bool,
}

impl DefaultClassifier {
    /// A classifier that treats attempt timeouts as fatal.
    pub const fn new() -> Self {
        Self {
            retry_timeouts: false,
        }
    }

    /// Chooses whether attempt timeouts count as transient.
    #[must_use]
    pub const fn retry_timeouts(mut self, retry: bool) -> Self {
        self.retry_timeouts = retry;
        self
    }
}

impl<E: DriverError> TransientClassifier<E> for DefaultClassifier {
    fn is_transient(&self, error: &E) -> bool {
        detect_transient(error).is_some()
    }

    fn is_transient_timeout(&self, _limit: Duration) -> Option<bool> {
        Some(self.retry_timeouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_millis(50);

    #[test]
    fn postgres_sqlstates_are_transient() {
        let cases = [
            ("40P01", TransientCondition::Deadlock),
            ("55P03", TransientCondition::LockNotAvailable),
            ("40001", TransientCondition::SerializationFailure),
        ];

        for (code, expected) in cases {
            let error = ErrorInfo::new("whatever").with_sqlstate(code);
            assert_eq!(detect_transient(&error), Some(expected), "sqlstate {code}");
        }
    }

    #[test]
    fn postgres_messages_are_transient_without_a_code() {
        let statement = ErrorInfo::new("ERROR: canceling statement due to statement timeout");
        let lock = ErrorInfo::new("ERROR: Canceling statement due to lock timeout");
        let deadlock = ErrorInfo::new("ERROR: deadlock detected");

        assert_eq!(
            detect_transient(&statement),
            Some(TransientCondition::StatementTimeout)
        );
        assert_eq!(
            detect_transient(&lock),
            Some(TransientCondition::LockNotAvailable)
        );
        assert_eq!(
            detect_transient(&deadlock),
            Some(TransientCondition::Deadlock)
        );
    }

    #[test]
    fn mysql_error_numbers_are_transient() {
        let cases = [
            (1213, TransientCondition::Deadlock),
            (1205, TransientCondition::LockNotAvailable),
            (3572, TransientCondition::LockNotAvailable),
            (2006, TransientCondition::ConnectionLost),
            (2013, TransientCondition::ConnectionLost),
        ];

        for (errno, expected) in cases {
            let error = ErrorInfo::new("server said no").with_errno(errno);
            assert_eq!(detect_transient(&error), Some(expected), "errno {errno}");
        }
    }

    #[test]
    fn sqlite_lock_message_is_transient() {
        let error = ErrorInfo::new("database is locked");
        assert_eq!(
            detect_transient(&error),
            Some(TransientCondition::DatabaseLocked)
        );
    }

    #[test]
    fn generic_tokens_require_an_operational_class() {
        let unclassified = ErrorInfo::new("MySQL server has gone away");
        let operational = unclassified.clone().with_class(ErrorClass::Operational);
        let interface = ErrorInfo::new("connection reset by peer").with_class(ErrorClass::Interface);

        assert_eq!(detect_transient(&unclassified), None);
        assert_eq!(
            detect_transient(&operational),
            Some(TransientCondition::ConnectionLost)
        );
        assert_eq!(
            detect_transient(&interface),
            Some(TransientCondition::ConnectionLost)
        );
    }

    #[test]
    fn constraint_violations_are_not_transient() {
        let error = ErrorInfo::new("duplicate key value violates unique constraint")
            .with_sqlstate("23505")
            .with_class(ErrorClass::Operational);

        assert_eq!(detect_transient(&error), None);
        assert!(!DefaultClassifier::new().is_transient(&error));
    }

    #[test]
    fn default_classifier_rejects_timeouts_unless_configured() {
        let strict = DefaultClassifier::new();
        let lenient = DefaultClassifier::new().retry_timeouts(true);

        assert_eq!(
            TransientClassifier::<ErrorInfo>::is_transient_timeout(&strict, LIMIT),
            Some(false)
        );
        assert_eq!(
            TransientClassifier::<ErrorInfo>::is_transient_timeout(&lenient, LIMIT),
            Some(true)
        );
    }

    #[test]
    fn retry_on_any_admits_errors_but_not_timeouts() {
        let retry_on = RetryOn::<ErrorInfo>::any();
        let failure = AttemptFailure::Operation(ErrorInfo::new("boom"));
        let timeout = AttemptFailure::TimedOut { limit: LIMIT };

        assert!(is_retryable(&failure, &retry_on, None));
        assert!(!is_retryable(&timeout, &retry_on, None));
        assert!(is_retryable(&timeout, &retry_on.including_timeouts(), None));
    }

    #[test]
    fn classifier_cannot_widen_the_retry_set_for_errors() {
        let retry_on = RetryOn::matching(|e: &ErrorInfo| e.errno == Some(1213));
        let always = |_: &ErrorInfo| true;
        let outside = AttemptFailure::Operation(ErrorInfo::new("boom").with_errno(1205));

        assert!(!is_retryable(&outside, &retry_on, Some(&always)));
    }

    #[test]
    fn classifier_takes_precedence_inside_the_retry_set() {
        let retry_on = RetryOn::<ErrorInfo>::any();
        let never = |_: &ErrorInfo| false;
        let failure = AttemptFailure::Operation(ErrorInfo::new("deadlock detected"));

        assert!(!is_retryable(&failure, &retry_on, Some(&never)));
        assert!(is_retryable(
            &failure,
            &retry_on,
            Some(&DefaultClassifier::new())
        ));
    }

    #[test]
    fn classifier_can_approve_timeouts_on_its_own() {
        let retry_on = RetryOn::<ErrorInfo>::any();
        let timeout = AttemptFailure::TimedOut { limit: LIMIT };
        let lenient = DefaultClassifier::new().retry_timeouts(true);

        assert!(is_retryable(&timeout, &retry_on, Some(&lenient)));
        assert!(!is_retryable(
            &timeout,
            &retry_on.clone().including_timeouts(),
            Some(&DefaultClassifier::new())
        ));
    }

    #[test]
    fn closure_classifiers_defer_timeouts_to_the_retry_set() {
        let always = |_: &ErrorInfo| true;
        let timeout = AttemptFailure::TimedOut { limit: LIMIT };

        assert!(is_retryable(
            &timeout,
            &RetryOn::any().including_timeouts(),
            Some(&always)
        ));
        assert!(!is_retryable(&timeout, &RetryOn::any(), Some(&always)));
    }

    #[test]
    fn nothing_rejects_everything() {
        let retry_on = RetryOn::<ErrorInfo>::nothing();
        let failure = AttemptFailure::Operation(ErrorInfo::new("deadlock detected"));

        assert!(!is_retryable(
            &failure,
            &retry_on,
            Some(&DefaultClassifier::new())
        ));
    }
}
