//! Normalized PostgreSQL errors.

use std::borrow::Cow;

use dbop::{DriverError, ErrorClass, ErrorInfo};
use thiserror::Error;

/// SQLSTATE class for connection exceptions.
const CONNECTION_EXCEPTION_CLASS: &str = "08";

/// Error returned by PostgreSQL operations, scopes and hooks.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The server rejected a statement.
    #[error("{message}")]
    Database {
        /// Five-character SQLSTATE, when the server sent one.
        sqlstate: Option<String>,
        /// Server message.
        message: String,
        /// Underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The connection failed, dropped or could not be obtained.
    #[error("connection error: {0}")]
    Connection(#[source] sqlx::Error),

    /// A client-side failure, such as a decoding error or a missing row.
    #[error("postgres client error: {0}")]
    Client(#[source] sqlx::Error),
}

/// Result type alias for PostgreSQL operations.
pub type PostgresResult<T> = Result<T, PostgresError>;

impl From<sqlx::Error> for PostgresError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(ref db_error) => Self::Database {
                sqlstate: db_error.code().map(Cow::into_owned),
                message: db_error.message().to_string(),
                source: error,
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(error),
            _ => Self::Client(error),
        }
    }
}

impl PostgresError {
    /// Whether the connection is unusable or was never obtained.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Database { sqlstate, .. } => sqlstate
                .as_deref()
                .is_some_and(|code| code.starts_with(CONNECTION_EXCEPTION_CLASS)),
            Self::Client(_) => false,
        }
    }
}

impl DriverError for PostgresError {
    fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Database { sqlstate, .. } => sqlstate.as_deref(),
            Self::Connection(_) | Self::Client(_) => None,
        }
    }

    fn message(&self) -> Cow<'_, str> {
        match self {
            Self::Database { message, .. } => Cow::Borrowed(message),
            Self::Connection(source) | Self::Client(source) => Cow::Owned(source.to_string()),
        }
    }

    fn error_class(&self) -> ErrorClass {
        if self.is_connection_error() {
            return ErrorClass::Interface;
        }
        match self {
            Self::Database { .. } => ErrorClass::Operational,
            Self::Connection(_) => ErrorClass::Interface,
            Self::Client(_) => ErrorClass::Other,
        }
    }
}

impl From<PostgresError> for ErrorInfo {
    fn from(error: PostgresError) -> Self {
        let info = Self::new(DriverError::message(&error)).with_class(error.error_class());
        match error.sqlstate() {
            Some(code) => info.with_sqlstate(code),
            None => info,
        }
    }
}
