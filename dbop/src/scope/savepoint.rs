//! Bookkeeping for attempt scopes built on a transaction and a savepoint.
//!
//! SQL drivers bracket an attempt the same way: open a transaction unless the
//! session already has one, set a savepoint, and on exit either release it or
//! roll back to it. [`SavepointState`] tracks what a scope has claimed on its
//! session so that a scope interrupted while entering still undoes whatever it
//! may have started.

/// What a savepoint scope has claimed on its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavepointState {
    owns_transaction: bool,
    savepoint_set: bool,
}

/// How a savepoint scope undoes its attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Return to the attempt's savepoint.
    pub to_savepoint: bool,
    /// Roll back the whole transaction the scope opened.
    pub whole_transaction: bool,
    /// A failed savepoint rollback is the scope's result. When the scope owns
    /// the transaction the failure is only logged, since the transaction
    /// rollback discards the same work.
    pub savepoint_error_is_final: bool,
}

/// How a savepoint scope makes its attempt durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPlan {
    /// Release the attempt's savepoint.
    pub release_savepoint: bool,
    /// Commit the transaction the scope opened.
    pub whole_transaction: bool,
}

impl SavepointState {
    /// A scope that has claimed nothing yet.
    pub const fn new() -> Self {
        Self {
            owns_transaction: false,
            savepoint_set: false,
        }
    }

    /// Records the claim before any statement reaches the session.
    ///
    /// `opens_transaction` is whether the session had no transaction open.
    /// Claiming first means a scope dropped halfway through `enter` plans a
    /// full rollback.
    pub fn claim(&mut self, opens_transaction: bool) {
        self.owns_transaction = opens_transaction;
        self.savepoint_set = true;
    }

    /// Forgets the claim after `enter` has cleaned up on its own.
    pub fn abandon(&mut self) {
        *self = Self::new();
    }

    /// Whether the scope opened the session's transaction.
    pub const fn owns_transaction(&self) -> bool {
        self.owns_transaction
    }

    /// Whether the attempt's savepoint may still be set.
    pub const fn savepoint_set(&self) -> bool {
        self.savepoint_set
    }

    /// Plans the commit of a session that reports `in_transaction`.
    pub const fn commit_plan(&self, in_transaction: bool) -> CommitPlan {
        CommitPlan {
            release_savepoint: self.savepoint_set,
            whole_transaction: self.owns_transaction && in_transaction,
        }
    }

    /// Marks the savepoint released.
    pub fn released(&mut self) {
        self.savepoint_set = false;
    }

    /// Plans the rollback of a session that reports `in_transaction` and
    /// marks the savepoint gone.
    pub fn rollback_plan(&mut self, in_transaction: bool) -> RollbackPlan {
        let plan = RollbackPlan {
            to_savepoint: self.savepoint_set,
            whole_transaction: self.owns_transaction && in_transaction,
            savepoint_error_is_final: !self.owns_transaction,
        };
        self.savepoint_set = false;
        plan
    }
}
