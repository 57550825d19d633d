//! PostgreSQL collaborators for the `dbop` retry engine.
//!
//! This crate binds the engine to a single `sqlx` [`PgConnection`]:
//!
//! - [`PostgresSession`] owns the connection and tracks whether a transaction
//!   is open on it;
//! - [`PostgresScopes`] brackets every attempt with a transaction and a
//!   savepoint, so a failed attempt leaves nothing behind;
//! - [`StatementTimeouts`] applies per-attempt `SET LOCAL` timeouts;
//! - [`PostgresError`] normalizes `sqlx::Error` so the default classifier can
//!   recognize deadlocks, lock timeouts and dropped connections.
//!
//! ```ignore
//! use dbop::{DefaultClassifier, Executor};
//! use dbop_postgres::{PostgresError, PostgresSession, StatementTimeouts};
//! use std::time::Duration;
//!
//! let session = PostgresSession::connect("postgres://localhost/app").await?;
//! let executor = Executor::<PostgresError>::new()
//!     .with_classifier(DefaultClassifier::new())
//!     .with_attempt_scope(session.attempt_scopes())
//!     .with_pre_attempt(
//!         StatementTimeouts::new(session.clone()).lock_timeout(Duration::from_millis(250)),
//!     );
//!
//! executor
//!     .execute(|| {
//!         let session = session.clone();
//!         async move {
//!             let mut conn = session.lock().await;
//!             sqlx::query("UPDATE accounts SET balance = balance - 10 WHERE id = 1")
//!                 .execute(&mut *conn)
//!                 .await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod error;
mod scope;
mod timeouts;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

pub use error::{PostgresError, PostgresResult};
pub use scope::{PostgresAttemptScope, PostgresScopes, SAVEPOINT_NAME};
pub use timeouts::StatementTimeouts;

/// A PostgreSQL connection shared by an executor and its operations.
///
/// Clones share the same connection. Operations, scopes and hooks take turns
/// through [`lock`](Self::lock); a guard must not be held across an attempt
/// boundary.
#[derive(Clone)]
pub struct PostgresSession {
    state: Arc<Mutex<SessionState>>,
}

struct SessionState {
    connection: PgConnection,
    in_transaction: bool,
}

impl std::fmt::Debug for PostgresSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSession").finish_non_exhaustive()
    }
}

impl PostgresSession {
    /// Opens a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection cannot be established.
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> PostgresResult<Self> {
        let connection = PgConnection::connect(url).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps an already open connection that is not inside a transaction.
    pub fn from_connection(connection: PgConnection) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                connection,
                in_transaction: false,
            })),
        }
    }

    /// Waits for exclusive access to the connection.
    pub async fn lock(&self) -> SessionGuard<'_> {
        SessionGuard(self.state.lock().await)
    }

    /// Whether a transaction opened through this session is still open.
    pub async fn in_transaction(&self) -> bool {
        self.state.lock().await.in_transaction
    }

    /// A scope factory bracketing each attempt with a savepoint.
    pub fn attempt_scopes(&self) -> PostgresScopes {
        PostgresScopes::new(self.clone())
    }
}

/// Exclusive access to a session's connection.
///
/// Dereferences to [`PgConnection`], so `&mut *guard` is a `sqlx` executor.
pub struct SessionGuard<'a>(MutexGuard<'a, SessionState>);

impl SessionGuard<'_> {
    /// Whether the session has a transaction open.
    pub fn in_transaction(&self) -> bool {
        self.0.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, open: bool) {
        self.0.in_transaction = open;
    }

    pub(crate) async fn run(&mut self, statement: &str) -> PostgresResult<()> {
        sqlx::Executor::execute(&mut self.0.connection, sqlx::raw_sql(statement)).await?;
        Ok(())
    }
}

impl Deref for SessionGuard<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0.connection
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.connection
    }
}
