//! Per-attempt session timeouts.

use std::time::Duration;

use dbop::PreAttempt;
use futures::future::BoxFuture;
use tracing::trace;

use crate::{MySqlError, MySqlSession};

/// Pre-attempt hook that sets `innodb_lock_wait_timeout` and
/// `MAX_EXECUTION_TIME` for the session.
///
/// MySQL has no transaction-local form of these settings, so they stay in
/// effect on the connection after the attempt. A lock wait timeout surfaces
/// as error 1205, which the default classifier retries. The execution limit
/// only applies to `SELECT` statements.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    session: MySqlSession,
    lock_wait_timeout: Option<Duration>,
    max_execution_time: Option<Duration>,
}

impl SessionTimeouts {
    /// A hook that sets nothing until a timeout is configured.
    pub const fn new(session: MySqlSession) -> Self {
        Self {
            session,
            lock_wait_timeout: None,
            max_execution_time: None,
        }
    }

    /// Longest wait for a row lock, rounded up to whole seconds. InnoDB
    /// waits at least one second.
    #[must_use]
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = Some(timeout);
        self
    }

    /// Longest run time for a `SELECT`. Zero disables the limit.
    #[must_use]
    pub fn max_execution_time(mut self, timeout: Duration) -> Self {
        self.max_execution_time = Some(timeout);
        self
    }

    /// The `SET SESSION` statements issued before every attempt.
    pub fn statements(&self) -> Vec<String> {
        set_session_statements(self.lock_wait_timeout, self.max_execution_time)
    }
}

fn set_session_statements(
    lock_wait_timeout: Option<Duration>,
    max_execution_time: Option<Duration>,
) -> Vec<String> {
    let mut statements = Vec::with_capacity(2);
    if let Some(timeout) = lock_wait_timeout {
        statements.push(format!(
            "SET SESSION innodb_lock_wait_timeout = {}",
            whole_seconds(timeout)
        ));
    }
    if let Some(timeout) = max_execution_time {
        statements.push(format!(
            "SET SESSION MAX_EXECUTION_TIME = {}",
            timeout.as_millis()
        ));
    }
    statements
}

fn whole_seconds(timeout: Duration) -> u64 {
    let seconds = timeout.as_secs();
    let rounded = if timeout.subsec_nanos() > 0 {
        seconds.saturating_add(1)
    } else {
        seconds
    };
    rounded.max(1)
}

impl<E> PreAttempt<E> for SessionTimeouts
where
    E: From<MySqlError> + Send + 'static,
{
    fn run(&self) -> BoxFuture<'_, Result<(), E>> {
        Box::pin(async move {
            let statements = self.statements();
            if statements.is_empty() {
                return Ok::<(), E>(());
            }
            let mut conn = self.session.lock().await;
            for statement in &statements {
                trace!(%statement, "Applying attempt timeout");
                conn.run(statement).await?;
            }
            Ok::<(), E>(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_waits_round_up_to_whole_seconds() {
        assert_eq!(whole_seconds(Duration::from_millis(250)), 1);
        assert_eq!(whole_seconds(Duration::from_millis(2500)), 3);
        assert_eq!(whole_seconds(Duration::from_secs(2)), 2);
        assert_eq!(whole_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn only_configured_timeouts_are_set() {
        assert!(set_session_statements(None, None).is_empty());
        assert_eq!(
            set_session_statements(Some(Duration::from_secs(2)), Some(Duration::from_millis(750))),
            vec![
                "SET SESSION innodb_lock_wait_timeout = 2",
                "SET SESSION MAX_EXECUTION_TIME = 750"
            ]
        );
        assert_eq!(
            set_session_statements(None, Some(Duration::ZERO)),
            vec!["SET SESSION MAX_EXECUTION_TIME = 0"]
        );
    }
}
