//! Attempt scopes that record what the engine does with them.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dbop::{AttemptScope, BlockingAttemptScope, BlockingScopeFactory, ScopeFactory};

/// A scope transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeEventKind {
    /// `enter` was called.
    Enter {
        /// The read-only flag the scope was created with.
        read_only: bool,
    },
    /// `commit` was called.
    Commit,
    /// `rollback` was called.
    Rollback,
}

/// One recorded transition of the scope created for `attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeEvent {
    /// 1-based index of the scope, in creation order.
    pub attempt: u32,
    /// What happened.
    pub kind: ScopeEventKind,
}

#[derive(Debug, Default)]
struct Journal {
    created: u32,
    events: Vec<ScopeEvent>,
}

/// Factory whose scopes succeed at every transition and record it.
///
/// Clones share one journal, so a clone can be handed to an executor while
/// the original is kept for assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingScopes {
    journal: Arc<Mutex<Journal>>,
}

impl RecordingScopes {
    /// Creates a factory with an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded transition, in order.
    pub fn events(&self) -> Vec<ScopeEvent> {
        self.lock().events.clone()
    }

    /// Number of scopes created so far.
    pub fn scopes_created(&self) -> u32 {
        self.lock().created
    }

    /// Number of commits.
    pub fn commits(&self) -> usize {
        self.count(|kind| kind == ScopeEventKind::Commit)
    }

    /// Number of rollbacks.
    pub fn rollbacks(&self) -> usize {
        self.count(|kind| kind == ScopeEventKind::Rollback)
    }

    /// Transitions of the scope created for `attempt`.
    pub fn events_for(&self, attempt: u32) -> Vec<ScopeEventKind> {
        self.lock()
            .events
            .iter()
            .filter(|event| event.attempt == attempt)
            .map(|event| event.kind)
            .collect()
    }

    fn count(&self, predicate: impl Fn(ScopeEventKind) -> bool) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|event| predicate(event.kind))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal
            .lock()
            .expect("scope journal mutex should not be poisoned")
    }

    fn scope<E>(&self, read_only: bool) -> RecordingScope<E> {
        let attempt = {
            let mut journal = self.lock();
            journal.created += 1;
            journal.created
        };
        RecordingScope {
            journal: Arc::clone(&self.journal),
            attempt,
            read_only,
            error: PhantomData,
        }
    }
}

impl<E: Send + 'static> ScopeFactory<E> for RecordingScopes {
    fn create(&self, read_only: bool) -> Box<dyn AttemptScope<E>> {
        Box::new(self.scope(read_only))
    }
}

impl<E: Send + 'static> BlockingScopeFactory<E> for RecordingScopes {
    fn create(&self, read_only: bool) -> Box<dyn BlockingAttemptScope<E>> {
        Box::new(self.scope(read_only))
    }
}

struct RecordingScope<E> {
    journal: Arc<Mutex<Journal>>,
    attempt: u32,
    read_only: bool,
    error: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for RecordingScope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingScope")
            .field("attempt", &self.attempt)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl<E> RecordingScope<E> {
    fn push(&self, kind: ScopeEventKind) {
        self.journal
            .lock()
            .expect("scope journal mutex should not be poisoned")
            .events
            .push(ScopeEvent {
                attempt: self.attempt,
                kind,
            });
    }
}

impl<E: Send> BlockingAttemptScope<E> for RecordingScope<E> {
    fn enter(&mut self) -> Result<(), E> {
        self.push(ScopeEventKind::Enter {
            read_only: self.read_only,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), E> {
        self.push(ScopeEventKind::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), E> {
        self.push(ScopeEventKind::Rollback);
        Ok(())
    }
}

#[async_trait]
impl<E: Send> AttemptScope<E> for RecordingScope<E> {
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
