//! Shared fixtures for dbop-sqlite integration tests.
//!
//! Each fixture creates its own database file in the temp directory and
//! removes it on drop.

#![allow(dead_code)]

use std::env;
use std::fs;
use std::path::PathBuf;

use dbop_sqlite::SqliteSession;
use uuid::Uuid;

/// A database file plus a session connected to it.
pub struct SqliteFixture {
    /// Session used by the executor under test.
    pub session: SqliteSession,
    /// Connection string for secondary connections.
    pub connection_string: String,
    path: PathBuf,
}

impl SqliteFixture {
    pub async fn new() -> Self {
        let path = env::temp_dir().join(format!("dbop_{}.db", Uuid::now_v7().simple()));
        let connection_string = format!("sqlite://{}?mode=rwc", path.display());
        let session = SqliteSession::connect(&connection_string)
            .await
            .expect("should open sqlite database");
        {
            let mut conn = session.lock().await;
            sqlx::raw_sql("CREATE TABLE items (id INTEGER PRIMARY KEY, value TEXT NOT NULL)")
                .execute(&mut *conn)
                .await
                .expect("should create test table");
        }

        Self {
            session,
            connection_string,
            path,
        }
    }

    /// A second, independent connection to the same file.
    pub async fn other_session(&self) -> SqliteSession {
        SqliteSession::connect(&self.connection_string)
            .await
            .expect("should open a second connection")
    }

    /// Row count of `items`, read outside any attempt.
    pub async fn count(&self) -> i64 {
        let mut conn = self.session.lock().await;
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
            .fetch_one(&mut *conn)
            .await
            .expect("should count rows")
    }
}

impl Drop for SqliteFixture {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
