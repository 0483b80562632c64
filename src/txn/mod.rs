//! Transaction Module
//!
//! Units of work over the key-value engine.
//!
//! ## Responsibilities
//! - Lazily open one engine session per unit of work
//! - Hold the list of `{commit, rollback}` actions registered by writers
//! - Run commit actions in registration order after a successful engine
//!   commit, rollback actions in reverse order otherwise
//! - Track a snapshot generation so cursors can detect that they were moved
//!   to a different snapshot without `restore()`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use tracing::debug;

use crate::error::{AtlasError, Result};
use crate::kv::{KvEngine, KvSession};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// An action whose effect depends on how the unit of work ends
pub trait Change: Send {
    fn commit(self: Box<Self>);
    fn rollback(self: Box<Self>);
}

/// Closure-backed change for one-sided hooks
struct Hook {
    on_commit: Option<Box<dyn FnOnce() + Send>>,
    on_rollback: Option<Box<dyn FnOnce() + Send>>,
}

impl Change for Hook {
    fn commit(self: Box<Self>) {
        if let Some(f) = self.on_commit {
            f();
        }
    }

    fn rollback(self: Box<Self>) {
        if let Some(f) = self.on_rollback {
            f();
        }
    }
}

/// A unit of work: one engine session plus its registered changes
///
/// A recovery unit can be reused after `commit()` or `abort()`; the next
/// operation starts a new session on a fresh snapshot. Dropping a unit with
/// pending work rolls it back.
pub struct RecoveryUnit {
    engine: Arc<dyn KvEngine>,
    id: u64,
    generation: u64,
    session: Option<Box<dyn KvSession>>,
    changes: Vec<Box<dyn Change>>,
    timestamp: Option<u64>,
}

impl RecoveryUnit {
    pub fn new(engine: Arc<dyn KvEngine>) -> Self {
        Self {
            engine,
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            session: None,
            changes: Vec::new(),
            timestamp: None,
        }
    }

    /// Process-unique id of this unit
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bumped every time the unit leaves its current snapshot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The engine session, opened on first use
    pub fn session(&mut self) -> Result<&mut dyn KvSession> {
        if self.session.is_none() {
            let mut session = self.engine.begin()?;
            if let Some(ts) = self.timestamp {
                session.set_timestamp(ts)?;
            }
            self.session = Some(session);
        }
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(AtlasError::NoUnitOfWork),
        }
    }

    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    /// Whether writers registered actions that are not resolved yet
    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Stamp subsequent writes in this unit with `ts`
    pub fn set_timestamp(&mut self, ts: u64) -> Result<()> {
        self.timestamp = Some(ts);
        if let Some(session) = self.session.as_deref_mut() {
            session.set_timestamp(ts)?;
        }
        Ok(())
    }

    pub fn register_change(&mut self, change: Box<dyn Change>) {
        self.changes.push(change);
    }

    /// Run `f` only if the unit commits
    pub fn on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.changes.push(Box::new(Hook {
            on_commit: Some(Box::new(f)),
            on_rollback: None,
        }));
    }

    /// Run `f` only if the unit rolls back
    pub fn on_rollback(&mut self, f: impl FnOnce() + Send + 'static) {
        self.changes.push(Box::new(Hook {
            on_commit: None,
            on_rollback: Some(Box::new(f)),
        }));
    }

    /// Commit the session, then resolve the registered changes
    ///
    /// On engine failure every change is rolled back and the error returned.
    pub fn commit(&mut self) -> Result<()> {
        let session = self.session.take();
        let changes = std::mem::take(&mut self.changes);
        self.timestamp = None;
        self.generation += 1;

        let outcome = match session {
            Some(session) => session.commit(),
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                for change in changes {
                    change.commit();
                }
                Ok(())
            }
            Err(e) => {
                debug!(unit = self.id, error = %e, "commit failed, rolling back changes");
                for change in changes.into_iter().rev() {
                    change.rollback();
                }
                Err(e)
            }
        }
    }

    /// Discard the session's writes and roll back the registered changes
    pub fn abort(&mut self) {
        let had_work = self.session.is_some() || !self.changes.is_empty();
        if let Some(session) = self.session.take() {
            session.rollback();
        }
        for change in std::mem::take(&mut self.changes).into_iter().rev() {
            change.rollback();
        }
        self.timestamp = None;
        if had_work {
            self.generation += 1;
        }
    }

    /// Release the current snapshot so the next read sees newer data
    ///
    /// Only legal when no writes are pending.
    pub fn abandon_snapshot(&mut self) -> Result<()> {
        if !self.changes.is_empty() {
            return Err(AtlasError::IllegalOperation(
                "cannot abandon a snapshot with uncommitted changes".into(),
            ));
        }
        if let Some(session) = self.session.take() {
            session.rollback();
        }
        self.generation += 1;
        Ok(())
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        if self.session.is_some() || !self.changes.is_empty() {
            self.abort();
        }
    }
}

/// Run `op` until it stops failing with a write conflict
///
/// `op` must redo the whole logical operation in a fresh unit of work.
pub fn retry_on_write_conflict<T, F>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let backoff = Backoff::new();
    let mut attempts = 0u64;
    loop {
        match op() {
            Err(e) if e.is_retryable() => {
                attempts += 1;
                debug!(op = op_name, attempts, "write conflict, retrying");
                backoff.snooze();
            }
            other => return other,
        }
    }
}
