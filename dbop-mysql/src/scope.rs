//! Transaction and savepoint bracketing for attempts.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use dbop::{AttemptScope, RollbackPlan, SavepointState, ScopeFactory};
use tracing::{debug, warn};

use crate::{MySqlError, MySqlResult, MySqlSession, SessionGuard};

/// Savepoint set at the start of every attempt.
pub const SAVEPOINT_NAME: &str = "dbop_attempt";

/// Scope factory for a [`MySqlSession`].
#[derive(Debug, Clone)]
pub struct MySqlScopes {
    session: MySqlSession,
}

impl MySqlScopes {
    /// Creates a factory whose scopes run on `session`.
    pub const fn new(session: MySqlSession) -> Self {
        Self { session }
    }
}

impl<E> ScopeFactory<E> for MySqlScopes
where
    E: From<MySqlError> + Send + 'static,
{
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        Box::new(MySqlAttemptScope::new(self.session.clone(), read_only))
    }
}

/// Isolation for one attempt on a MySQL session.
///
/// Entering starts a transaction unless one is already open, read only when
/// asked to, and sets [`SAVEPOINT_NAME`]. Commit releases the savepoint and
/// commits the transaction the scope started; rollback returns to the
/// savepoint and rolls that transaction back. A transaction opened by the
/// caller is left open either way.
pub struct MySqlAttemptScope<E> {
    session: MySqlSession,
    read_only: bool,
    state: SavepointState,
    error: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for MySqlAttemptScope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlAttemptScope")
            .field("read_only", &self.read_only)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<E> MySqlAttemptScope<E> {
    /// Creates a scope that has not been entered yet.
    pub const fn new(session: MySqlSession, read_only: bool) -> Self {
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
    let mut statements = Vec::with_capacity(2);
    if !in_transaction {
        statements.push(if read_only {
            "START TRANSACTION READ ONLY".to_string()
        } else {
            "START TRANSACTION".to_string()
        });
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

async fn run_all(conn: &mut SessionGuard<'_>, statements: &[String]) -> MySqlResult<()> {
    for statement in statements {
        conn.run(statement).await?;
    }
    Ok(())
}

#[async_trait]
impl<E> AttemptScope<E> for MySqlAttemptScope<E>
where
    E: From<MySqlError> + Send + 'static,
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
            conn.run("COMMIT").await?;
            conn.set_in_transaction(false);
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
