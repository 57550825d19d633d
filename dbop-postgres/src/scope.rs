//! Transaction and savepoint bracketing for attempts.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use dbop::{AttemptScope, RollbackPlan, SavepointState, ScopeFactory};
use tracing::{debug, warn};

use crate::{PostgresError, PostgresResult, PostgresSession, SessionGuard};

/// Savepoint set at the start of every attempt.
pub const SAVEPOINT_NAME: &str = "dbop_attempt";

/// Scope factory for a [`PostgresSession`].
///
/// Works for any error type an operation can convert [`PostgresError`] into.
#[derive(Debug, Clone)]
pub struct PostgresScopes {
    session: PostgresSession,
}

impl PostgresScopes {
    /// Creates a factory whose scopes run on `session`.
    pub const fn new(session: PostgresSession) -> Self {
        Self { session }
    }
}

impl<E> ScopeFactory<E> for PostgresScopes
where
    E: From<PostgresError> + Send + 'static,
{
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        Box::new(PostgresAttemptScope::new(self.session.clone(), read_only))
    }
}

/// Isolation for one attempt on a PostgreSQL session.
///
/// Entering opens a transaction unless one is already open, marks it read
/// only when asked to, and sets [`SAVEPOINT_NAME`]. Commit releases the
/// savepoint and commits the transaction the scope opened. Rollback returns to
/// the savepoint and rolls back the transaction the scope opened. A
/// transaction opened by the caller is left open either way.
pub struct PostgresAttemptScope<E> {
    session: PostgresSession,
    read_only: bool,
    state: SavepointState,
    error: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for PostgresAttemptScope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresAttemptScope")
            .field("read_only", &self.read_only)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<E> PostgresAttemptScope<E> {
    /// Creates a scope that has not been entered yet.
    pub const fn new(session: PostgresSession, read_only: bool) -> Self {
        Self {
            session,
            read_only,
            state: SavepointState::new(),
            error: PhantomData,
        }
    }
}

/// Statements issued by `enter` for a session in the given state.
pub(crate) fn enter_statements(in_transaction: bool, read_only: bool) -> Vec<String> {
    let mut statements = Vec::with_capacity(3);
    if !in_transaction {
        statements.push("BEGIN".to_string());
        if read_only {
            statements.push("SET TRANSACTION READ ONLY".to_string());
        }
    }
    statements.push(format!("SAVEPOINT {SAVEPOINT_NAME}"));
    statements
}

/// Savepoint and transaction rollbacks issued by `rollback`, in order.
pub(crate) fn rollback_statements(plan: RollbackPlan) -> (Option<String>, Option<&'static str>) {
    (
        plan.to_savepoint
            .then(|| format!("ROLLBACK TO SAVEPOINT {SAVEPOINT_NAME}")),
        plan.whole_transaction.then_some("ROLLBACK"),
    )
}

async fn run_all(conn: &mut SessionGuard<'_>, statements: &[String]) -> PostgresResult<()> {
    for statement in statements {
        conn.run(statement).await?;
    }
    Ok(())
}

#[async_trait]
impl<E> AttemptScope<E> for PostgresAttemptScope<E>
where
    E: From<PostgresError> + Send + 'static,
{
    async fn enter(&mut self) -> Result<(), E> {
        let mut conn = self.session.lock().await;
        let opens = !conn.in_transaction();
        if self.read_only && !opens {
            debug!("Read-only attempt joins an open transaction; access mode unchanged");
        }

        let statements = enter_statements(!opens, self.read_only);
        self.state.claim(opens);
        if opens {
            conn.set_in_transaction(true);
        }
        if let Err(error) = run_all(&mut conn, &statements).await {
            if opens {
                conn.set_in_transaction(false);
                if let Err(cleanup) = conn.run("ROLLBACK").await {
                    warn!(error = %cleanup, "Could not close transaction after failed enter");
                }
            }
            self.state.abandon();
            return Err(E::from(error));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), E> {
        let mut conn = self.session.lock().await;
        let plan = self.state.commit_plan(conn.in_transaction());
        if plan.release_savepoint {
            conn.run(&format!("RELEASE SAVEPOINT {SAVEPOINT_NAME}"))
                .await?;
            self.state.released();
        }

        if plan.whole_transaction {
            // the server ends the transaction whether or not COMMIT succeeds
            conn.set_in_transaction(false);
            conn.run("COMMIT").await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), E> {
        let mut conn = self.session.lock().await;
        let plan = self.state.rollback_plan(conn.in_transaction());
        let (to_savepoint, whole_transaction) = rollback_statements(plan);
        let savepoint_result = match to_savepoint {
            Some(statement) => conn.run(&statement).await,
            None => Ok(()),
        };

        if plan.savepoint_error_is_final {
            return savepoint_result.map_err(E::from);
        }
        if let Err(error) = savepoint_result {
            debug!(error = %error, "Savepoint rollback failed; rolling back the transaction");
        }
        if let Some(statement) = whole_transaction {
            conn.set_in_transaction(false);
            conn.run(statement).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_begins_a_transaction() {
        assert_eq!(
            enter_statements(false, false),
            vec!["BEGIN", "SAVEPOINT dbop_attempt"]
        );
    }

    #[test]
    fn read_only_attempts_mark_the_transaction() {
        assert_eq!(
            enter_statements(false, true),
            vec!["BEGIN", "SET TRANSACTION READ ONLY", "SAVEPOINT dbop_attempt"]
        );
    }

    #[test]
    fn open_transaction_only_gets_a_savepoint() {
        assert_eq!(enter_statements(true, true), vec!["SAVEPOINT dbop_attempt"]);
    }

    #[test]
    fn scopes_interrupted_while_entering_roll_back_the_whole_transaction() {
        let mut state = SavepointState::new();
        state.claim(true);

        assert_eq!(
            rollback_statements(state.rollback_plan(true)),
            (
                Some("ROLLBACK TO SAVEPOINT dbop_attempt".to_string()),
                Some("ROLLBACK")
            )
        );
    }

    #[test]
    fn joined_transactions_roll_back_to_the_savepoint_only() {
        let mut state = SavepointState::new();
        state.claim(false);

        assert_eq!(
            rollback_statements(state.rollback_plan(true)),
            (Some("ROLLBACK TO SAVEPOINT dbop_attempt".to_string()), None)
        );
    }
}
