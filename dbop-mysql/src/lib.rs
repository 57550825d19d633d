//! MySQL collaborators for the `dbop` retry engine.
//!
//! This crate binds the engine to a single `sqlx` [`MySqlConnection`]:
//!
//! - [`MySqlSession`] owns the connection and tracks whether a transaction is
//!   open on it;
//! - [`MySqlScopes`] brackets every attempt with a transaction and a
//!   savepoint;
//! - [`SessionTimeouts`] sets InnoDB's lock wait limit and the statement
//!   execution limit before each attempt;
//! - [`MySqlError`] keeps the server error number so the default classifier
//!   can recognize deadlocks (1213) and lock wait timeouts (1205).
//!
//! ```ignore
//! use dbop::{DefaultClassifier, Executor};
//! use dbop_mysql::{MySqlError, MySqlSession, SessionTimeouts};
//! use std::time::Duration;
//!
//! let session = MySqlSession::connect("mysql://app@localhost/app").await?;
//! let executor = Executor::<MySqlError>::new()
//!     .with_classifier(DefaultClassifier::new())
//!     .with_attempt_scope(session.attempt_scopes())
//!     .with_pre_attempt(
//!         SessionTimeouts::new(session.clone()).lock_wait_timeout(Duration::from_secs(2)),
//!     );
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod error;
mod scope;
mod timeouts;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::mysql::MySqlConnection;
use sqlx::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

pub use error::{MySqlError, MySqlResult};
pub use scope::{MySqlAttemptScope, MySqlScopes, SAVEPOINT_NAME};
pub use timeouts::SessionTimeouts;

/// A MySQL connection shared by an executor and its operations.
///
/// Clones share the same connection. Operations, scopes and hooks take turns
/// through [`lock`](Self::lock); a guard must not be held across an attempt
/// boundary.
#[derive(Clone)]
pub struct MySqlSession {
    state: Arc<Mutex<SessionState>>,
}

struct SessionState {
    connection: MySqlConnection,
    in_transaction: bool,
}

impl std::fmt::Debug for MySqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSession").finish_non_exhaustive()
    }
}

impl MySqlSession {
    /// Opens a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection cannot be established.
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> MySqlResult<Self> {
        let connection = MySqlConnection::connect(url).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps an already open connection that is not inside a transaction.
    pub fn from_connection(connection: MySqlConnection) -> Self {
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
    pub fn attempt_scopes(&self) -> MySqlScopes {
        MySqlScopes::new(self.clone())
    }
}

/// Exclusive access to a session's connection.
///
/// Dereferences to [`MySqlConnection`], so `&mut *guard` is a `sqlx`
/// executor. Statements that commit implicitly, such as DDL, end the
/// transaction without the session noticing; keep them out of attempts.
pub struct SessionGuard<'a>(MutexGuard<'a, SessionState>);

impl SessionGuard<'_> {
    /// Whether the session has a transaction open.
    pub fn in_transaction(&self) -> bool {
        self.0.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, open: bool) {
        self.0.in_transaction = open;
    }

    pub(crate) async fn run(&mut self, statement: &str) -> MySqlResult<()> {
        sqlx::Executor::execute(&mut self.0.connection, sqlx::raw_sql(statement)).await?;
        Ok(())
    }
}

impl Deref for SessionGuard<'_> {
    type Target = MySqlConnection;

    fn deref(&self) -> &Self::Target {
        &self.0.connection
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.connection
    }
}
