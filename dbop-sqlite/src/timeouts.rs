//! Lock wait limit for attempts.

use std::time::Duration;

use dbop::PreAttempt;
use futures::future::BoxFuture;
use tracing::trace;

use crate::{SqliteError, SqliteSession};

/// Pre-attempt hook that sets `PRAGMA busy_timeout`.
///
/// SQLite has no per-statement timeout; the busy timeout bounds how long a
/// statement waits for another connection's lock before failing with
/// "database is locked", which the default classifier retries. The pragma
/// applies to the connection, so it stays in effect after the attempt.
#[derive(Debug, Clone)]
pub struct BusyTimeout {
    session: SqliteSession,
    timeout: Duration,
}

impl BusyTimeout {
    /// Waits at most `timeout` for a lock. Zero fails immediately.
    pub const fn new(session: SqliteSession, timeout: Duration) -> Self {
        Self { session, timeout }
    }

    /// The pragma issued before every attempt.
    pub fn statement(&self) -> String {
        busy_timeout_statement(self.timeout)
    }
}

/// Milliseconds, capped at what SQLite accepts.
fn busy_timeout_statement(timeout: Duration) -> String {
    let millis = timeout
        .as_millis()
        .min(u128::from(i32::MAX.unsigned_abs()));
    format!("PRAGMA busy_timeout = {millis}")
}

impl<E> PreAttempt<E> for BusyTimeout
where
    E: From<SqliteError> + Send + 'static,
{
    fn run(&self) -> BoxFuture<'_, Result<(), E>> {
        Box::pin(async move {
            let statement = self.statement();
            trace!(%statement, "Applying busy timeout");
            self.session.lock().await.run(&statement).await?;
            Ok::<(), E>(())
        })
    }
}
