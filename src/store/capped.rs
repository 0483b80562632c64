//! Capped Collection Reclaimer
//!
//! Keeps an ordinary capped collection under its byte / document ceiling by
//! deleting its oldest records in bulk.
//!
//! ## Back-pressure
//! Only one thread deletes at a time. A writer that finds the deleter busy
//! returns immediately while the overage is within the slack window
//! (`min(max_size / 10, capped_slack_ceiling)`); past that it waits a bounded
//! time for the lock, which slows writers that outpace deletion.

use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AtlasError, Result};
use crate::kv::Direction;
use crate::record::RecordId;
use crate::txn::RecoveryUnit;

use super::StoreInner;

/// Observer of records removed from a capped collection
pub trait CappedCallback: Send + Sync {
    /// Called before `id` is deleted, inside the deleting unit of work
    fn about_to_delete_capped(&self, ru: &mut RecoveryUnit, id: RecordId, data: &[u8])
        -> Result<()>;

    /// Called after every committed insert into a capped collection so
    /// tailing readers blocked on new data can wake up
    fn notify_capped_waiters_if_needed(&self) {}
}

/// Run the callback for `id`, wrapping its failure as [`AtlasError::Callback`]
///
/// Write conflicts pass through unchanged so callers can retry.
pub(crate) fn run_callback(
    callback: &dyn CappedCallback,
    ru: &mut RecoveryUnit,
    id: RecordId,
    data: &[u8],
) -> Result<()> {
    callback
        .about_to_delete_capped(ru, id, data)
        .map_err(|e| match e {
            e if e.is_retryable() => e,
            e @ AtlasError::Callback(_) => e,
            e => AtlasError::Callback(format!("record {}: {}", id, e)),
        })
}

pub(crate) struct CappedReclaimer {
    /// Single-deleter lock
    lock: Mutex<()>,
    /// Oldest record known to survive the last deletion (null = table start)
    first_record: AtomicCell<RecordId>,
    slack: AtomicI64,
    sleeps: AtomicU64,
    sleep_ms: AtomicU64,
}

fn slack_for(max_size: i64, ceiling: i64) -> i64 {
    (max_size / 10).min(ceiling)
}

impl CappedReclaimer {
    pub(crate) fn new(max_size: i64, slack_ceiling: i64) -> Self {
        Self {
            lock: Mutex::new(()),
            first_record: AtomicCell::new(RecordId::NULL),
            slack: AtomicI64::new(slack_for(max_size, slack_ceiling)),
            sleeps: AtomicU64::new(0),
            sleep_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_max_size(&self, max_size: i64, slack_ceiling: i64) {
        self.slack
            .store(slack_for(max_size, slack_ceiling), Ordering::SeqCst);
    }

    pub(crate) fn first_record(&self) -> RecordId {
        self.first_record.load()
    }

    pub(crate) fn reset_first_record(&self) {
        self.first_record.store(RecordId::NULL);
    }

    /// (times a writer waited for the deleter, total milliseconds waited)
    pub(crate) fn sleep_stats(&self) -> (u64, u64) {
        (
            self.sleeps.load(Ordering::Relaxed),
            self.sleep_ms.load(Ordering::Relaxed),
        )
    }

    /// Delete the oldest records until the store is back under its limits
    ///
    /// Never deletes `just_inserted` or anything newer. Returns the number of
    /// records removed; 0 when another thread is already deleting.
    pub(crate) fn delete_as_needed(
        &self,
        store: &Arc<StoreInner>,
        just_inserted: RecordId,
    ) -> Result<i64> {
        // Document caps are exact, so wait for the lock
        let _guard = if store.max_docs.is_some() {
            self.lock.lock()
        } else {
            match self.lock.try_lock() {
                Some(guard) => guard,
                None => {
                    let slack = self.slack.load(Ordering::SeqCst);
                    if store.data_size() - store.max_size() < slack {
                        return Ok(0);
                    }

                    let started = Instant::now();
                    let acquired = self
                        .lock
                        .try_lock_for(store.config.capped_backpressure_wait());
                    self.sleeps.fetch_add(1, Ordering::Relaxed);
                    self.sleep_ms
                        .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

                    let Some(guard) = acquired else {
                        return Ok(0);
                    };
                    // Someone else just deleted; only continue if still far over
                    if store.data_size() - store.max_size() < 2 * slack {
                        return Ok(0);
                    }
                    guard
                }
            }
        };

        match self.delete_locked(store, just_inserted) {
            Err(AtlasError::WriteConflict) => {
                warn!(ns = %store.ns, "write conflict during capped deletion, deferring");
                Ok(0)
            }
            other => other,
        }
    }

    fn delete_locked(&self, store: &Arc<StoreInner>, just_inserted: RecordId) -> Result<i64> {
        let format = store.key_format;
        let size_over = (store.data_size() - store.max_size()).max(0);
        let docs_over = store
            .max_docs
            .map_or(0, |max| (store.num_records() - max).max(0));
        let limit = store.config.capped_delete_batch_limit as i64;

        let mut ru = RecoveryUnit::new(Arc::clone(&store.kv));
        let first = self.first_record.load();
        let start_key = if first.is_null() {
            format.range().0
        } else {
            format.encode(first)
        };

        let callback = store.capped_callback();
        let mut last_key: Option<Vec<u8>> = None;
        let (mut docs_removed, mut size_saved) = (0i64, 0i64);

        while (size_saved < size_over || docs_removed < docs_over) && docs_removed < limit {
            let from = match &last_key {
                Some(key) => Bound::Excluded(key.as_slice()),
                None => Bound::Included(start_key.as_slice()),
            };
            let entry = ru.session()?.scan_next(&store.table, from, Direction::Forward)?;
            let Some(entry) = entry.filter(|e| format.owns(&e.key)) else {
                break;
            };

            let id = format.decode(&entry.key)?;
            if id >= just_inserted || store.is_shutting_down() {
                break;
            }
            if let Some(callback) = &callback {
                run_callback(callback.as_ref(), &mut ru, id, &entry.value)?;
            }

            docs_removed += 1;
            size_saved += entry.value.len() as i64;
            last_key = Some(entry.key);
        }

        let Some(last_key) = last_key else {
            return Ok(0);
        };

        ru.session()?.truncate(
            &store.table,
            Bound::Included(start_key.as_slice()),
            Bound::Included(last_key.as_slice()),
        )?;
        store.change_num_records(&mut ru, -docs_removed);
        store.increase_data_size(&mut ru, -size_saved);

        let next = ru.session()?.scan_next(
            &store.table,
            Bound::Excluded(last_key.as_slice()),
            Direction::Forward,
        )?;
        let first_remaining = match next {
            Some(entry) if format.owns(&entry.key) => format.decode(&entry.key)?,
            _ => RecordId::NULL,
        };

        ru.commit()?;
        self.first_record.store(first_remaining);

        debug!(
            ns = %store.ns,
            docs_removed,
            size_saved,
            first_remaining = %first_remaining,
            "capped deletion"
        );
        Ok(docs_removed)
    }
}
