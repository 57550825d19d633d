//! Per-attempt server-side timeouts.

use std::time::Duration;

use dbop::PreAttempt;
use futures::future::BoxFuture;
use tracing::trace;

use crate::{PostgresError, PostgresSession};

/// Pre-attempt hook that applies `lock_timeout` and `statement_timeout` to
/// the attempt's transaction with `SET LOCAL`.
///
/// The settings end with the transaction, so the hook must run inside an
/// attempt scope such as [`PostgresScopes`](crate::PostgresScopes). A lock
/// timeout surfaces as SQLSTATE `55P03` and a statement timeout as a
/// cancelled statement; the default classifier retries both.
#[derive(Debug, Clone)]
pub struct StatementTimeouts {
    session: PostgresSession,
    lock_timeout: Option<Duration>,
    statement_timeout: Option<Duration>,
}

impl StatementTimeouts {
    /// A hook that sets nothing until a timeout is configured.
    pub const fn new(session: PostgresSession) -> Self {
        Self {
            session,
            lock_timeout: None,
            statement_timeout: None,
        }
    }

    /// Longest wait for any single lock. Zero disables the limit.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Longest run time for any single statement. Zero disables the limit.
    #[must_use]
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// The `SET LOCAL` statements issued before every attempt.
    pub fn statements(&self) -> Vec<String> {
        set_local_statements(self.lock_timeout, self.statement_timeout)
    }
}

fn set_local_statements(
    lock_timeout: Option<Duration>,
    statement_timeout: Option<Duration>,
) -> Vec<String> {
    [
        ("lock_timeout", lock_timeout),
        ("statement_timeout", statement_timeout),
    ]
    .into_iter()
    .filter_map(|(setting, timeout)| {
        timeout.map(|timeout| format!("SET LOCAL {setting} = '{}'", setting_value(timeout)))
    })
    .collect()
}

/// Milliseconds as PostgreSQL expects them; sub-millisecond limits round up.
fn setting_value(timeout: Duration) -> String {
    if timeout.is_zero() {
        return "0".to_string();
    }
    let millis = timeout.as_millis().max(1);
    format!("{millis}ms")
}

impl<E> PreAttempt<E> for StatementTimeouts
where
    E: From<PostgresError> + Send + 'static,
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
