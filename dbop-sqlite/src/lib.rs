//! SQLite collaborators for the `dbop` retry engine.
//!
//! This crate binds the engine to a single `sqlx` [`SqliteConnection`]:
//!
//! - [`SqliteSession`] owns the connection and tracks whether a transaction
//!   is open on it;
//! - [`SqliteScopes`] brackets every attempt with a transaction and a
//!   savepoint;
//! - [`BusyTimeout`] sets how long a statement waits for a locked database
//!   file before failing;
//! - [`SqliteError`] normalizes `sqlx::Error` so the default classifier can
//!   recognize "database is locked".
//!
//! ```ignore
//! use dbop::{DefaultClassifier, Executor};
//! use dbop_sqlite::{BusyTimeout, SqliteError, SqliteSession};
//! use std::time::Duration;
//!
//! let session = SqliteSession::connect("sqlite://app.db?mode=rwc").await?;
//! let executor = Executor::<SqliteError>::new()
//!     .with_classifier(DefaultClassifier::new())
//!     .with_attempt_scope(session.attempt_scopes())
//!     .with_pre_attempt(BusyTimeout::new(session.clone(), Duration::from_millis(250)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod error;
mod scope;
mod timeouts;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

pub use error::{SqliteError, SqliteResult};
pub use scope::{SqliteAttemptScope, SqliteScopes, SAVEPOINT_NAME};
pub use timeouts::BusyTimeout;

/// A SQLite connection shared by an executor and its operations.
///
/// Clones share the same connection. Operations, scopes and hooks take turns
/// through [`lock`](Self::lock).
#[derive(Clone)]
pub struct SqliteSession {
    state: Arc<Mutex<SessionState>>,
}

struct SessionState {
    connection: SqliteConnection,
    in_transaction: bool,
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession").finish_non_exhaustive()
    }
}

impl SqliteSession {
    /// Opens the database at `url`, e.g. `sqlite://app.db?mode=rwc`.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened.
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> SqliteResult<Self> {
        let connection = SqliteConnection::connect(url).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps an already open connection that is not inside a transaction.
    pub fn from_connection(connection: SqliteConnection) -> Self {
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
    pub fn attempt_scopes(&self) -> SqliteScopes {
        SqliteScopes::new(self.clone())
    }
}

/// Exclusive access to a session's connection.
///
/// Dereferences to [`SqliteConnection`], so `&mut *guard` is a `sqlx`
/// executor.
pub struct SessionGuard<'a>(MutexGuard<'a, SessionState>);

impl SessionGuard<'_> {
    /// Whether the session has a transaction open.
    pub fn in_transaction(&self) -> bool {
        self.0.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, open: bool) {
        self.0.in_transaction = open;
    }

    pub(crate) async fn run(&mut self, statement: &str) -> SqliteResult<()> {
        sqlx::Executor::execute(&mut self.0.connection, sqlx::raw_sql(statement)).await?;
        Ok(())
    }
}

impl Deref for SessionGuard<'_> {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.0.connection
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.connection
    }
}
