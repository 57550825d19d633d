//! Attempt scopes, error numbers and session timeouts against a real server.
//!
//! These tests start MySQL containers and are ignored unless Docker is
//! available: `cargo test -p dbop-mysql -- --ignored`.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::MySqlFixture;
use dbop::{DefaultClassifier, DriverError, ExecuteError, Executor, Jitter, RetryPolicy};
use dbop_mysql::{MySqlError, SessionTimeouts};
use tokio_test::{assert_err, assert_ok};

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(50))
        .max_delay(Duration::from_millis(200))
        .jitter(Jitter::None)
        .build()
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn failed_attempts_leave_no_rows_behind() {
    let fixture = MySqlFixture::new().await;
    let table = fixture.create_table().await;
    let executor = Executor::<MySqlError>::new()
        .with_policy(policy(2))
        .with_classifier(|error: &MySqlError| error.errno() == Some(1062))
        .with_attempt_scope(fixture.session.attempt_scopes());
    let calls = AtomicU32::new(0);

    let result = executor
        .execute(|| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let session = fixture.session.clone();
            let table = table.clone();
            async move {
                let mut conn = session.lock().await;
                sqlx::query(&format!("INSERT INTO {table} (id, value) VALUES (?, 'row')"))
                    .bind(call)
                    .execute(&mut *conn)
                    .await?;
                if call == 1 {
                    sqlx::raw_sql(&format!("INSERT INTO {table} VALUES (1, 'duplicate')"))
                        .execute(&mut *conn)
                        .await?;
                }
                Ok::<_, MySqlError>(())
            }
        })
        .await;

    assert_ok!(result);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.count(&table).await, 1);
    assert!(!fixture.session.in_transaction().await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn read_only_attempts_reject_writes() {
    let fixture = MySqlFixture::new().await;
    let table = fixture.create_table().await;
    let executor = Executor::<MySqlError>::new()
        .with_policy(policy(3))
        .with_classifier(DefaultClassifier::new())
        .with_attempt_scope(fixture.session.attempt_scopes())
        .read_only(true);

    let error = assert_err!(
        executor
            .execute(|| {
                let session = fixture.session.clone();
                let table = table.clone();
                async move {
                    let mut conn = session.lock().await;
                    sqlx::raw_sql(&format!("INSERT INTO {table} VALUES (1, 'nope')"))
                        .execute(&mut *conn)
                        .await?;
                    Ok::<_, MySqlError>(())
                }
            })
            .await
    );

    assert!(matches!(error, ExecuteError::Fatal { attempt: 1, .. }));
    let source = error.into_source().expect("the operation failed");
    assert_eq!(source.errno(), Some(1792));
    assert_eq!(fixture.count(&table).await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lock_wait_timeouts_are_retried_until_the_lock_is_released() {
    let fixture = MySqlFixture::new().await;
    let table = fixture.create_table().await;
    {
        let mut conn = fixture.session.lock().await;
        sqlx::raw_sql(&format!("INSERT INTO {table} VALUES (1, 'initial')"))
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    let holder = fixture.other_session().await;
    {
        let mut conn = holder.lock().await;
        sqlx::raw_sql(&format!(
            "START TRANSACTION; SELECT * FROM {table} WHERE id = 1 FOR UPDATE"
        ))
        .execute(&mut *conn)
        .await
        .unwrap();
    }
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let mut conn = holder.lock().await;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("COMMIT")).await.unwrap();
    });

    let executor = Executor::<MySqlError>::new()
        .with_policy(policy(10))
        .with_classifier(DefaultClassifier::new())
        .with_attempt_scope(fixture.session.attempt_scopes())
        .with_pre_attempt(
            SessionTimeouts::new(fixture.session.clone())
                .lock_wait_timeout(Duration::from_secs(1))
                .max_execution_time(Duration::from_secs(5)),
        );
    let calls = AtomicU32::new(0);

    let result = executor
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            let session = fixture.session.clone();
            let table = table.clone();
            async move {
                let mut conn = session.lock().await;
                sqlx::raw_sql(&format!("UPDATE {table} SET value = 'updated' WHERE id = 1"))
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, MySqlError>(())
            }
        })
        .await;

    release.await.unwrap();
    assert_ok!(result);
    assert!(calls.load(Ordering::SeqCst) > 1);
}
