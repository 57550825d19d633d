//! Normalized SQLite errors.

use std::borrow::Cow;

use dbop::{DriverError, ErrorClass, ErrorInfo};
use thiserror::Error;

/// Primary result codes, i.e. the low byte of an extended code.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_IOERR: i64 = 10;
const SQLITE_CANTOPEN: i64 = 14;
const SQLITE_CONSTRAINT: i64 = 19;

/// Error returned by SQLite operations, scopes and hooks.
#[derive(Debug, Error)]
pub enum SqliteError {
    /// SQLite rejected a statement.
    #[error("{message}")]
    Database {
        /// Extended result code, e.g. `5` for `SQLITE_BUSY`.
        code: Option<i64>,
        /// SQLite message.
        message: String,
        /// Underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The database could not be opened or the connection worker stopped.
    #[error("connection error: {0}")]
    Connection(#[source] sqlx::Error),

    /// A client-side failure, such as a decoding error or a missing row.
    #[error("sqlite client error: {0}")]
    Client(#[source] sqlx::Error),
}

/// Result type alias for SQLite operations.
pub type SqliteResult<T> = Result<T, SqliteError>;

impl From<sqlx::Error> for SqliteError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(ref db_error) => Self::Database {
                code: db_error.code().and_then(|code| code.parse().ok()),
                message: db_error.message().to_string(),
                source: error,
            },
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(error),
            _ => Self::Client(error),
        }
    }
}

impl SqliteError {
    /// The primary result code of a database error.
    pub const fn primary_code(&self) -> Option<i64> {
        match self {
            Self::Database {
                code: Some(code), ..
            } => Some(*code & 0xff),
            _ => None,
        }
    }

    /// Whether another connection held a conflicting lock.
    pub fn is_busy(&self) -> bool {
        matches!(self.primary_code(), Some(SQLITE_BUSY | SQLITE_LOCKED))
    }
}

impl DriverError for SqliteError {
    fn message(&self) -> Cow<'_, str> {
        match self {
            Self::Database { message, .. } => Cow::Borrowed(message),
            Self::Connection(source) | Self::Client(source) => Cow::Owned(source.to_string()),
        }
    }

    fn error_class(&self) -> ErrorClass {
        match self {
            Self::Database { .. } => match self.primary_code() {
                Some(SQLITE_CONSTRAINT) => ErrorClass::Other,
                Some(SQLITE_IOERR | SQLITE_CANTOPEN) => ErrorClass::Interface,
                _ => ErrorClass::Operational,
            },
            Self::Connection(_) => ErrorClass::Interface,
            Self::Client(_) => ErrorClass::Other,
        }
    }
}

impl From<SqliteError> for ErrorInfo {
    fn from(error: SqliteError) -> Self {
        Self::new(DriverError::message(&error)).with_class(error.error_class())
    }
}
