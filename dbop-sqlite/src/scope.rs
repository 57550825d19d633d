//! Transaction and savepoint bracketing for attempts.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use dbop::{AttemptScope, RollbackPlan, SavepointState, ScopeFactory};
use tracing::{debug, warn};

use crate::{SessionGuard, SqliteError, SqliteResult, SqliteSession};

/// Savepoint set at the start of every attempt.
pub const SAVEPOINT_NAME: &str = "dbop_attempt";

/// Scope factory for a [`SqliteSession`].
#[derive(Debug, Clone)]
pub struct SqliteScopes {
    session: SqliteSession,
}

impl SqliteScopes {
    /// Creates a factory whose scopes run on `session`.
    pub const fn new(session: SqliteSession) -> Self {
        Self { session }
    }
}

impl<E> ScopeFactory<E> for SqliteScopes
where
    E: From<SqliteError> + Send + 'static,
{
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        Box::new(SqliteAttemptScope::new(self.session.clone(), read_only))
    }
}

/// Isolation for one attempt on a SQLite connection.
///
/// Entering opens a deferred transaction unless one is already open and sets
/// [`SAVEPOINT_NAME`]. SQLite has no read-only transactions, so a read-only
/// scope that opens the transaction switches the connection to
/// `query_only` until it exits. A transaction opened by the caller is left
/// open and keeps its access mode.
pub struct SqliteAttemptScope<E> {
    session: SqliteSession,
    read_only: bool,
    state: SavepointState,
    query_only: bool,
    error: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for SqliteAttemptScope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteAttemptScope")
            .field("read_only", &self.read_only)
            .field("state", &self.state)
            .field("query_only", &self.query_only)
            .finish_non_exhaustive()
    }
}

impl<E> SqliteAttemptScope<E> {
    /// Creates a scope that has not been entered yet.
    pub const fn new(session: SqliteSession, read_only: bool) -> Self {
        Self {
            session,
            read_only,
            state: SavepointState::new(),
            query_only: false,
            error: PhantomData,
        }
    }

    /// Turns `query_only` back off if this scope turned it on.
    async fn restore_access(&mut self, conn: &mut SessionGuard<'_>) {
        if !self.query_only {
            return;
        }
        self.query_only = false;
        if let Err(error) = conn.run("PRAGMA query_only = OFF").await {
            warn!(error = %error, "Could not leave query_only mode");
        }
    }
}

/// Statements issued by `enter` for a session in the given state.
pub(crate) fn enter_statements(in_transaction: bool, read_only: bool) -> Vec<String> {
    let mut statements = Vec::with_capacity(3);
    if !in_transaction {
        if read_only {
            statements.push("PRAGMA query_only = ON".to_string());
        }
        statements.push("BEGIN".to_string());
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

async fn run_all(conn: &mut SessionGuard<'_>, statements: &[String]) -> SqliteResult<()> {
    for statement in statements {
        conn.run(statement).await?;
    }
    Ok(())
}

#[async_trait]
impl<E> AttemptScope<E> for SqliteAttemptScope<E>
where
    E: From<SqliteError> + Send + 'static,
{
    async fn enter(&mut self) -> Result<(), E> {
        let session = self.session.clone();
        let mut conn = session.lock().await;
        let opens = !conn.in_transaction();
        if self.read_only && !opens {
            debug!("Read-only attempt joins an open transaction; access mode unchanged");
        }

        let statements = enter_statements(!opens, self.read_only);
        self.state.claim(opens);
        self.query_only = opens && self.read_only;
        if opens {
            conn.set_in_transaction(true);
        }
        if let Err(error) = run_all(&mut conn, &statements).await {
            if opens {
                conn.set_in_transaction(false);
                if let Err(cleanup) = conn.run("ROLLBACK").await {
                    debug!(error = %cleanup, "No transaction to close after failed enter");
                }
            }
            self.restore_access(&mut conn).await;
            self.state.abandon();
            return Err(E::from(error));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), E> {
        let session = self.session.clone();
        let mut conn = session.lock().await;
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
        self.restore_access(&mut conn).await;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), E> {
        let session = self.session.clone();
        let mut conn = session.lock().await;
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
        self.restore_access(&mut conn).await;
        Ok(())
    }
}
