//! Normalized MySQL errors.

use std::borrow::Cow;

use dbop::{DriverError, ErrorClass, ErrorInfo};
use sqlx::mysql::MySqlDatabaseError;
use thiserror::Error;

/// SQLSTATE class for connection exceptions.
const CONNECTION_EXCEPTION_CLASS: &str = "08";

/// Server error numbers after which the connection cannot be reused.
const CONNECTION_ERRNOS: [i64; 4] = [
    1040, // too many connections
    1053, // server shutdown in progress
    1927, // connection was killed
    4031, // disconnected for inactivity
];

/// Error returned by MySQL operations, scopes and hooks.
#[derive(Debug, Error)]
pub enum MySqlError {
    /// The server rejected a statement.
    #[error("({}) {message}", .errno.map_or_else(|| "?".to_string(), |n| n.to_string()))]
    Database {
        /// Server error number, e.g. 1213 for a deadlock.
        errno: Option<i64>,
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
    #[error("mysql client error: {0}")]
    Client(#[source] sqlx::Error),
}

/// Result type alias for MySQL operations.
pub type MySqlResult<T> = Result<T, MySqlError>;

impl From<sqlx::Error> for MySqlError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(ref db_error) => Self::Database {
                errno: db_error
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(|mysql| i64::from(mysql.number())),
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

impl MySqlError {
    /// Whether the connection is unusable or was never obtained.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Database {
                errno, sqlstate, ..
            } => {
                errno.is_some_and(|errno| CONNECTION_ERRNOS.contains(&errno))
                    || sqlstate
                        .as_deref()
                        .is_some_and(|code| code.starts_with(CONNECTION_EXCEPTION_CLASS))
            }
            Self::Client(_) => false,
        }
    }
}

impl DriverError for MySqlError {
    fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Database { sqlstate, .. } => sqlstate.as_deref(),
            Self::Connection(_) | Self::Client(_) => None,
        }
    }

    fn errno(&self) -> Option<i64> {
        match self {
            Self::Database { errno, .. } => *errno,
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

impl From<MySqlError> for ErrorInfo {
    fn from(error: MySqlError) -> Self {
        let mut info = Self::new(DriverError::message(&error)).with_class(error.error_class());
        if let Some(code) = error.sqlstate() {
            info = info.with_sqlstate(code);
        }
        if let Some(errno) = error.errno() {
            info = info.with_errno(errno);
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbop::{detect_transient, TransientCondition};
    use std::io;

    fn database(errno: i64, sqlstate: &str, message: &str) -> MySqlError {
        MySqlError::Database {
            errno: Some(errno),
            sqlstate: Some(sqlstate.to_string()),
            message: message.to_string(),
            source: sqlx::Error::Protocol(message.to_string()),
        }
    }

    #[test]
    fn error_numbers_drive_classification() {
        let cases = [
            (
                database(1213, "HY000", "Deadlock found when trying to get lock"),
                TransientCondition::Deadlock,
            ),
            // the server reports deadlocks under the serialization failure state
            (
                database(1213, "40001", "Deadlock found when trying to get lock"),
                TransientCondition::SerializationFailure,
            ),
            (
                database(1205, "HY000", "Lock wait timeout exceeded"),
                TransientCondition::LockNotAvailable,
            ),
            (
                database(
                    3572,
                    "HY000",
                    "Statement aborted because lock(s) could not be acquired",
                ),
                TransientCondition::LockNotAvailable,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_class(), ErrorClass::Operational);
            assert_eq!(detect_transient(&error), Some(expected), "{error}");
        }
    }

    #[test]
    fn killed_connections_are_interface_errors() {
        let error = database(1927, "70100", "Connection was killed");

        assert!(error.is_connection_error());
        assert_eq!(error.error_class(), ErrorClass::Interface);
    }

    #[test]
    fn dropped_connections_are_transient() {
        let error = MySqlError::from(sqlx::Error::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )));

        assert!(error.is_connection_error());
        assert_eq!(error.errno(), None);
        assert_eq!(
            detect_transient(&error),
            Some(TransientCondition::ConnectionLost)
        );
    }

    #[test]
    fn duplicate_keys_are_not_transient() {
        let error = database(1062, "23000", "Duplicate entry '1' for key 'PRIMARY'");

        assert_eq!(detect_transient(&error), None);
    }

    #[test]
    fn database_errors_render_with_their_number() {
        let error = database(1205, "HY000", "Lock wait timeout exceeded");

        insta::assert_snapshot!(error.to_string(), @"(1205) Lock wait timeout exceeded");
    }

    #[test]
    fn error_info_carries_errno_and_sqlstate() {
        let info = ErrorInfo::from(database(1213, "40001", "Deadlock found"));

        assert_eq!(info.errno, Some(1213));
        assert_eq!(info.sqlstate.as_deref(), Some("40001"));
        assert_eq!(info.class, ErrorClass::Operational);
    }
}
