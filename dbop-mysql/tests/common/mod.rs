//! Shared fixtures for dbop-mysql integration tests.
//!
//! Each fixture starts its own MySQL container with testcontainers and
//! removes it on drop.

#![allow(dead_code)]

use std::env;

use dbop_mysql::MySqlSession;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mysql::Mysql;
use uuid::Uuid;

/// MySQL image tag, from `MYSQL_VERSION`, defaulting to "8.4".
pub fn mysql_version() -> String {
    env::var("MYSQL_VERSION").unwrap_or_else(|_| "8.4".to_string())
}

/// A running container plus a session connected to it.
pub struct MySqlFixture {
    /// Session used by the executor under test.
    pub session: MySqlSession,
    /// Connection string for secondary connections.
    pub connection_string: String,
    container: ContainerAsync<Mysql>,
}

impl MySqlFixture {
    pub async fn new() -> Self {
        let container = Mysql::default()
            .with_tag(mysql_version())
            .start()
            .await
            .expect("should start mysql container");
        let host_port = container
            .get_host_port_ipv4(3306)
            .await
            .expect("should get mysql port");
        let connection_string = format!("mysql://root@127.0.0.1:{host_port}/test");

        let session = MySqlSession::connect(&connection_string)
            .await
            .expect("should connect to mysql container");

        Self {
            session,
            connection_string,
            container,
        }
    }

    /// A second, independent session on the same database.
    pub async fn other_session(&self) -> MySqlSession {
        MySqlSession::connect(&self.connection_string)
            .await
            .expect("should open a second connection")
    }

    /// Creates a fresh InnoDB `(id INT PRIMARY KEY, value TEXT)` table and
    /// returns its name.
    pub async fn create_table(&self) -> String {
        let table = format!("items_{}", Uuid::now_v7().simple());
        let mut conn = self.session.lock().await;
        sqlx::raw_sql(&format!(
            "CREATE TABLE {table} (id INT PRIMARY KEY, value TEXT NOT NULL) ENGINE = InnoDB"
        ))
        .execute(&mut *conn)
        .await
        .expect("should create test table");
        table
    }

    /// Row count of `table`, read outside any attempt.
    pub async fn count(&self, table: &str) -> i64 {
        let mut conn = self.session.lock().await;
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut *conn)
            .await
            .expect("should count rows")
    }
}
