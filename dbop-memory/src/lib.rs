//! In-memory transactional database for dbop
//!
//! This crate provides a tiny key/value database with single-transaction
//! semantics and an attempt-scope factory for it. It is the reference
//! collaborator for dbop's tests and examples: every attempt runs inside a
//! transaction that is committed on success and discarded on failure, so the
//! effects of abandoned attempts are observable (or rather, not observable).
//!
//! # Example
//!
//! ```rust,ignore
//! use dbop::{DefaultClassifier, Executor};
//! use dbop_memory::{InMemoryDatabase, MemoryError};
//!
//! let db = InMemoryDatabase::new();
//! let executor = Executor::<MemoryError>::new()
//!     .with_classifier(DefaultClassifier::new())
//!     .with_attempt_scope(db.attempt_scopes());
//!
//! executor.execute(|| async { db.put("greeting", "hello".into()) }).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod scope;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use dbop::{DriverError, ErrorClass, ErrorInfo};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

pub use scope::{MemoryAttemptScope, MemoryScopes};

/// Errors raised by [`InMemoryDatabase`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Another writer holds the database lock.
    #[error("database is locked")]
    Locked,

    /// A write was attempted inside a read-only transaction.
    #[error("cannot write to key '{key}' in a read-only transaction")]
    ReadOnly {
        /// The key that was written.
        key: String,
    },

    /// `begin` was called while a transaction was already open.
    #[error("a transaction is already in progress")]
    TransactionInProgress,

    /// `commit` or `rollback` was called without an open transaction.
    #[error("no transaction in progress")]
    NoTransaction,
}

impl DriverError for MemoryError {
    fn message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn error_class(&self) -> ErrorClass {
        match self {
            Self::Locked => ErrorClass::Operational,
            Self::ReadOnly { .. } | Self::TransactionInProgress | Self::NoTransaction => {
                ErrorClass::Interface
            }
        }
    }
}

impl From<MemoryError> for ErrorInfo {
    fn from(error: MemoryError) -> Self {
        let class = error.error_class();
        Self::new(error.to_string()).with_class(class)
    }
}

/// Result alias for database calls.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Debug)]
struct Transaction {
    read_only: bool,
    // `None` marks a deletion
    writes: BTreeMap<String, Option<Value>>,
}

#[derive(Debug, Default)]
struct State {
    committed: BTreeMap<String, Value>,
    transaction: Option<Transaction>,
    locked: bool,
    commits: u64,
    rollbacks: u64,
}

impl State {
    fn writable(&mut self, key: &str) -> MemoryResult<Option<&mut Transaction>> {
        if self.locked {
            return Err(MemoryError::Locked);
        }
        match self.transaction.as_mut() {
            Some(tx) if tx.read_only => Err(MemoryError::ReadOnly {
                key: key.to_string(),
            }),
            other => Ok(other),
        }
    }
}

/// Cloneable handle to a shared in-memory database.
///
/// At most one transaction is open at a time. Outside a transaction every
/// write commits immediately.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `key`, seeing the open transaction's uncommitted writes.
    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.state.lock();
        if let Some(write) = state.transaction.as_ref().and_then(|tx| tx.writes.get(key)) {
            return write.clone();
        }
        state.committed.get(key).cloned()
    }

    /// Writes `key`.
    pub fn put(&self, key: impl Into<String>, value: Value) -> MemoryResult<()> {
        let key = key.into();
        let mut state = self.state.lock();
        trace!(key = %key, "put");
        if let Some(tx) = state.writable(&key)? {
            tx.writes.insert(key, Some(value));
        } else {
            state.committed.insert(key, value);
        }
        Ok(())
    }

    /// Removes `key`, returning the value it had.
    pub fn delete(&self, key: &str) -> MemoryResult<Option<Value>> {
        let previous = self.get(key);
        let mut state = self.state.lock();
        trace!(key = %key, "delete");
        if let Some(tx) = state.writable(key)? {
            tx.writes.insert(key.to_string(), None);
        } else {
            state.committed.remove(key);
        }
        Ok(previous)
    }

    /// The committed contents, ignoring any open transaction.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.state.lock().committed.clone()
    }

    /// Opens a transaction.
    pub fn begin(&self, read_only: bool) -> MemoryResult<()> {
        let mut state = self.state.lock();
        if state.transaction.is_some() {
            return Err(MemoryError::TransactionInProgress);
        }
        state.transaction = Some(Transaction {
            read_only,
            writes: BTreeMap::new(),
        });
        debug!(read_only, "Transaction started");
        Ok(())
    }

    /// Applies the open transaction's writes and closes it.
    pub fn commit(&self) -> MemoryResult<()> {
        let mut state = self.state.lock();
        if state.locked
            && state
                .transaction
                .as_ref()
                .is_some_and(|tx| !tx.writes.is_empty())
        {
            return Err(MemoryError::Locked);
        }
        let tx = state.transaction.take().ok_or(MemoryError::NoTransaction)?;
        let writes = tx.writes.len();
        for (key, value) in tx.writes {
            match value {
                Some(value) => state.committed.insert(key, value),
                None => state.committed.remove(&key),
            };
        }
        state.commits += 1;
        debug!(writes, "Transaction committed");
        Ok(())
    }

    /// Discards the open transaction.
    pub fn rollback(&self) -> MemoryResult<()> {
        let mut state = self.state.lock();
        let tx = state.transaction.take().ok_or(MemoryError::NoTransaction)?;
        state.rollbacks += 1;
        debug!(discarded = tx.writes.len(), "Transaction rolled back");
        Ok(())
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().transaction.is_some()
    }

    /// Simulates another writer holding the database lock until the guard drops.
    ///
    /// While held, writes and non-empty commits fail with [`MemoryError::Locked`].
    pub fn hold_lock(&self) -> WriterLock {
        self.state.lock().locked = true;
        WriterLock {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    /// Number of rolled back transactions.
    pub fn rollback_count(&self) -> u64 {
        self.state.lock().rollbacks
    }

    /// A factory producing one transaction per attempt.
    pub fn attempt_scopes(&self) -> MemoryScopes {
        MemoryScopes::new(self.clone())
    }
}

/// Guard returned by [`InMemoryDatabase::hold_lock`].
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriterLock {
    state: Arc<Mutex<State>>,
}

impl WriterLock {
    /// Releases the lock now.
    pub fn release(self) {}
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        self.state.lock().locked = false;
    }
}
