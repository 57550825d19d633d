//! Attempt scopes backed by [`InMemoryDatabase`] transactions.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use dbop::{AttemptScope, BlockingAttemptScope, BlockingScopeFactory, ScopeFactory};

use crate::{InMemoryDatabase, MemoryError};

/// Factory returned by [`InMemoryDatabase::attempt_scopes`].
///
/// Works with both executor styles and any error type a [`MemoryError`]
/// converts into.
#[derive(Debug, Clone)]
pub struct MemoryScopes {
    db: InMemoryDatabase,
}

impl MemoryScopes {
    /// Creates a factory for `db`.
    pub const fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }

    fn scope<E>(&self, read_only: bool) -> MemoryAttemptScope<E> {
        MemoryAttemptScope {
            db: self.db.clone(),
            read_only,
            error: PhantomData,
        }
    }
}

impl<E> ScopeFactory<E> for MemoryScopes
where
    E: From<MemoryError> + Send + 'static,
{
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        Box::new(self.scope(read_only))
    }
}

impl<E> BlockingScopeFactory<E> for MemoryScopes
where
    E: From<MemoryError> + Send + 'static,
{
    fn create(&self, read_only: bool) -> Box<dyn BlockingAttemptScope<E>> {
        Box::new(self.scope(read_only))
    }
}

/// One transaction, opened on enter and closed on commit or rollback.
pub struct MemoryAttemptScope<E> {
    db: InMemoryDatabase,
    read_only: bool,
    error: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for MemoryAttemptScope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAttemptScope")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl<E> BlockingAttemptScope<E> for MemoryAttemptScope<E>
where
    E: From<MemoryError> + Send,
{
    fn enter(&mut self) -> Result<(), E> {
        self.db.begin(self.read_only).map_err(E::from)
    }

    fn commit(&mut self) -> Result<(), E> {
        self.db.commit().map_err(E::from)
    }

    fn rollback(&mut self) -> Result<(), E> {
        self.db.rollback().map_err(E::from)
    }
}

#[async_trait]
impl<E> AttemptScope<E> for MemoryAttemptScope<E>
where
    E: From<MemoryError> + Send,
{
    async fn enter(&mut self) -> Result<(), E> {
        BlockingAttemptScope::enter(self)
    }

    async fn commit(&mut self) -> Result<(), E> {
        BlockingAttemptScope::commit(self)
    }

    async fn rollback(&mut self) -> Result<(), E> {
        BlockingAttemptScope::rollback(self)
    }
}
