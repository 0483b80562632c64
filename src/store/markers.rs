//! Retention Markers
//!
//! Bounds the replication log by truncating whole segments instead of
//! deleting entries one by one.
//!
//! ## Structure
//! ```text
//!   first_record        marker 0        marker 1          open segment
//!   |-------------------------|---------------|- - - - - - - - - ->
//!                      last_record     last_record    current_records
//!                                                     current_bytes
//! ```
//!
//! Inserts feed the open segment from a commit hook; once it holds
//! `min_bytes_per_marker` bytes it is closed into a marker. When more than
//! `markers_to_keep` markers exist, the oldest is truncated in one range
//! delete, either by the background [`ReclaimThread`] or by `reclaim_log()`.
//!
//! ## Lock Order
//! `reclaim_mutex` may be held while taking `markers`; never the reverse.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cursor::{RandomCursor, RecordCursor};
use crate::error::{AtlasError, Result};
use crate::record::RecordId;
use crate::txn::{Change, RecoveryUnit};

use super::StoreInner;

/// A closed log segment ending at `last_record`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionMarker {
    pub records: i64,
    pub bytes: i64,
    pub last_record: RecordId,
}

/// Marker state reported by `append_stats`
#[derive(Debug, Clone, Serialize)]
pub struct MarkerStats {
    pub num_markers: usize,
    pub markers_to_keep: i64,
    pub min_bytes_per_marker: i64,
    pub current_records: i64,
    pub current_bytes: i64,
    pub first_record: i64,
}

/// Marker list and open segment of one log store
pub struct RetentionMarkers {
    ns: String,
    markers: Mutex<VecDeque<RetentionMarker>>,
    current_records: AtomicI64,
    current_bytes: AtomicI64,
    min_bytes_per_marker: AtomicI64,
    markers_to_keep: AtomicI64,
    /// Oldest record that may still exist (null = table start)
    first_record: AtomicCell<RecordId>,

    /// Guards `dead` and pairs with `reclaim_cv`
    reclaim_mutex: Mutex<bool>,
    reclaim_cv: Condvar,
    /// Serializes reclaimers so a marker is truncated at most once
    reclaim_lock: Mutex<()>,

    min_markers_to_keep: i64,
    max_markers_to_keep: i64,
    max_record_size: i64,
    samples_per_marker: i64,
    min_sample_ratio: i64,
}

impl RetentionMarkers {
    pub(crate) fn new(ns: &str, config: &Config, max_size: i64) -> Self {
        let markers = Self {
            ns: ns.to_string(),
            markers: Mutex::new(VecDeque::new()),
            current_records: AtomicI64::new(0),
            current_bytes: AtomicI64::new(0),
            min_bytes_per_marker: AtomicI64::new(1),
            markers_to_keep: AtomicI64::new(config.min_markers_to_keep),
            first_record: AtomicCell::new(RecordId::NULL),
            reclaim_mutex: Mutex::new(false),
            reclaim_cv: Condvar::new(),
            reclaim_lock: Mutex::new(()),
            min_markers_to_keep: config.min_markers_to_keep,
            max_markers_to_keep: config.max_markers_to_keep,
            max_record_size: config.max_record_size.max(1),
            samples_per_marker: config.random_samples_per_marker.max(1),
            min_sample_ratio: config.min_sample_ratio,
        };
        markers.compute_sizing(max_size);
        markers
    }

    fn compute_sizing(&self, max_size: i64) {
        // Unvalidated min > max must not panic
        let to_keep = (max_size / self.max_record_size)
            .max(self.min_markers_to_keep)
            .min(self.max_markers_to_keep)
            .max(1);
        self.markers_to_keep.store(to_keep, Ordering::SeqCst);
        self.min_bytes_per_marker
            .store((max_size / to_keep).max(1), Ordering::SeqCst);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn num_markers(&self) -> usize {
        self.markers.lock().len()
    }

    /// Copy of the marker list, oldest first
    pub fn markers(&self) -> Vec<RetentionMarker> {
        self.markers.lock().iter().copied().collect()
    }

    pub fn current_records(&self) -> i64 {
        self.current_records.load(Ordering::SeqCst)
    }

    pub fn current_bytes(&self) -> i64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    pub fn min_bytes_per_marker(&self) -> i64 {
        self.min_bytes_per_marker.load(Ordering::SeqCst)
    }

    pub fn markers_to_keep(&self) -> i64 {
        self.markers_to_keep.load(Ordering::SeqCst)
    }

    pub fn first_record(&self) -> RecordId {
        self.first_record.load()
    }

    pub(crate) fn set_first_record(&self, id: RecordId) {
        self.first_record.store(id);
    }

    pub fn has_excess_markers(&self) -> bool {
        self.markers.lock().len() as i64 > self.markers_to_keep()
    }

    pub fn is_dead(&self) -> bool {
        *self.reclaim_mutex.lock()
    }

    pub fn stats(&self) -> MarkerStats {
        MarkerStats {
            num_markers: self.num_markers(),
            markers_to_keep: self.markers_to_keep(),
            min_bytes_per_marker: self.min_bytes_per_marker(),
            current_records: self.current_records(),
            current_bytes: self.current_bytes(),
            first_record: self.first_record().repr(),
        }
    }

    // =========================================================================
    // Reclaim Coordination
    // =========================================================================

    /// Block until a marker can be reclaimed or the store is killed
    ///
    /// Returns false if killed.
    pub fn await_has_excess_markers_or_dead(&self) -> bool {
        let mut dead = self.reclaim_mutex.lock();
        while !*dead && !self.has_excess_markers() {
            self.reclaim_cv.wait(&mut dead);
        }
        !*dead
    }

    /// Wake waiters; ends every current and future wait
    pub(crate) fn kill(&self) {
        let mut dead = self.reclaim_mutex.lock();
        *dead = true;
        self.reclaim_cv.notify_all();
    }

    /// Must be called without holding the marker lock
    fn poke_reclaimer_if_needed(&self) {
        if self.has_excess_markers() {
            let _dead = self.reclaim_mutex.lock();
            self.reclaim_cv.notify_all();
        }
    }

    /// Oldest marker, if keeping it would exceed the retention ceiling
    fn peek_oldest_marker_if_needed(&self) -> Option<RetentionMarker> {
        let markers = self.markers.lock();
        if markers.len() as i64 > self.markers_to_keep() {
            markers.front().copied()
        } else {
            None
        }
    }

    fn pop_oldest_marker(&self) {
        self.markers.lock().pop_front();
    }

    // =========================================================================
    // Steady State
    // =========================================================================

    /// Add committed inserts to the open segment, closing markers as it fills
    ///
    /// If another thread holds the marker lock the records only count toward
    /// the open segment; a later insert closes the marker.
    pub(crate) fn record_inserts(&self, inserted: &[(RecordId, i64)]) {
        let Some(mut markers) = self.markers.try_lock() else {
            let bytes: i64 = inserted.iter().map(|(_, len)| len).sum();
            self.current_records
                .fetch_add(inserted.len() as i64, Ordering::SeqCst);
            self.current_bytes.fetch_add(bytes, Ordering::SeqCst);
            return;
        };

        let min_bytes = self.min_bytes_per_marker();
        for &(id, len) in inserted {
            self.current_records.fetch_add(1, Ordering::SeqCst);
            let bytes = self.current_bytes.fetch_add(len, Ordering::SeqCst) + len;
            if bytes < min_bytes {
                continue;
            }
            if matches!(markers.back(), Some(newest) if id < newest.last_record) {
                // Committed out of order; let a later record close the segment
                continue;
            }

            let marker = RetentionMarker {
                records: self.current_records.swap(0, Ordering::SeqCst),
                bytes: self.current_bytes.swap(0, Ordering::SeqCst),
                last_record: id,
            };
            debug!(
                ns = %self.ns,
                last_record = %id,
                records = marker.records,
                bytes = marker.bytes,
                "closed retention marker"
            );
            markers.push_back(marker);
        }
        drop(markers);

        self.poke_reclaimer_if_needed();
    }

    /// Drop every marker once `ru` commits
    pub(crate) fn clear_on_commit(self: &Arc<Self>, ru: &mut RecoveryUnit) {
        let markers = Arc::clone(self);
        ru.on_commit(move || {
            markers.markers.lock().clear();
            markers.current_records.store(0, Ordering::SeqCst);
            markers.current_bytes.store(0, Ordering::SeqCst);
            markers.first_record.store(RecordId::NULL);
        });
    }

    /// Forget markers that reach into a removed tail of the log
    pub(crate) fn update_after_truncate_after(
        &self,
        records_removed: i64,
        bytes_removed: i64,
        first_removed: RecordId,
    ) {
        let mut markers = self.markers.lock();
        let (mut records, mut bytes) = (0i64, 0i64);
        while let Some(newest) = markers.back() {
            if newest.last_record < first_removed {
                break;
            }
            records += newest.records;
            bytes += newest.bytes;
            markers.pop_back();
        }

        // Whatever survived of the dropped markers rejoins the open segment
        self.current_records
            .fetch_add(records - records_removed, Ordering::SeqCst);
        self.current_bytes
            .fetch_add(bytes - bytes_removed, Ordering::SeqCst);
        debug!(
            ns = %self.ns,
            first_removed = %first_removed,
            markers_left = markers.len(),
            "adjusted markers after truncation"
        );
    }

    /// Resize markers for a new max size
    pub(crate) fn adjust(&self, max_size: i64) {
        self.compute_sizing(max_size);
        info!(
            ns = %self.ns,
            markers_to_keep = self.markers_to_keep(),
            min_bytes_per_marker = self.min_bytes_per_marker(),
            "adjusted retention markers"
        );
        self.poke_reclaimer_if_needed();
    }

    /// Force the marker size; only meaningful for an empty log
    pub(crate) fn set_min_bytes_per_marker(&self, bytes: i64) {
        self.min_bytes_per_marker.store(bytes.max(1), Ordering::SeqCst);
    }

    // =========================================================================
    // Cold Start
    // =========================================================================

    /// Build markers for the records already in the store
    pub(crate) fn initialize(&self, ru: &mut RecoveryUnit, store: &Arc<StoreInner>) -> Result<()> {
        let num_records = store.num_records();
        let data_size = store.data_size();
        let threshold = self.min_sample_ratio * self.samples_per_marker * self.markers_to_keep();

        if num_records <= 0 || data_size <= 0 || num_records < threshold {
            return self.populate_by_scanning(ru, store);
        }
        if !self.populate_by_sampling(ru, store)? {
            self.markers.lock().clear();
            return self.populate_by_scanning(ru, store);
        }
        Ok(())
    }

    fn populate_by_scanning(&self, ru: &mut RecoveryUnit, store: &Arc<StoreInner>) -> Result<()> {
        info!(ns = %self.ns, "scanning log to determine where to place markers");
        self.current_records.store(0, Ordering::SeqCst);
        self.current_bytes.store(0, Ordering::SeqCst);

        let min_bytes = self.min_bytes_per_marker();
        let mut cursor = RecordCursor::new(Arc::clone(store), true);
        let mut markers = self.markers.lock();
        let (mut num_records, mut data_size) = (0i64, 0i64);

        while let Some(record) = cursor.next(ru)? {
            let len = record.len() as i64;
            num_records += 1;
            data_size += len;
            self.current_records.fetch_add(1, Ordering::SeqCst);
            if self.current_bytes.fetch_add(len, Ordering::SeqCst) + len >= min_bytes {
                markers.push_back(RetentionMarker {
                    records: self.current_records.swap(0, Ordering::SeqCst),
                    bytes: self.current_bytes.swap(0, Ordering::SeqCst),
                    last_record: record.id,
                });
            }
        }
        drop(markers);

        store.update_stats_after_repair(num_records, data_size);
        info!(
            ns = %self.ns,
            markers = self.num_markers(),
            num_records,
            data_size,
            "placed markers by scanning"
        );
        Ok(())
    }

    /// Returns false if not enough samples could be drawn
    fn populate_by_sampling(&self, ru: &mut RecoveryUnit, store: &Arc<StoreInner>) -> Result<bool> {
        let num_records = store.num_records();
        let data_size = store.data_size();
        let k = self.samples_per_marker;

        let avg_record_size = (data_size / num_records).max(1);
        let est_records_per_marker =
            ((self.min_bytes_per_marker() as f64 / avg_record_size as f64).ceil() as i64).max(1);
        let est_bytes_per_marker = est_records_per_marker * avg_record_size;
        let num_samples = k * num_records / est_records_per_marker;

        let first = RecordCursor::new(Arc::clone(store), true).next(ru)?;
        let last = RecordCursor::new(Arc::clone(store), false).next(ru)?;
        let (Some(first), Some(last)) = (first, last) else {
            return Ok(false);
        };
        info!(
            ns = %self.ns,
            first = %first.id,
            last = %last.id,
            num_samples,
            "sampling log to determine where to place markers"
        );

        let mut random = RandomCursor::new(Arc::clone(store));
        let mut samples = Vec::with_capacity(num_samples.max(0) as usize);
        for _ in 0..num_samples {
            match random.next(ru)? {
                Some(record) => samples.push(record.id),
                None => {
                    warn!(ns = %self.ns, "not enough random samples, falling back to scanning");
                    return Ok(false);
                }
            }
        }
        samples.sort_unstable();

        let mut markers = self.markers.lock();
        for last_record in samples.iter().skip((k - 1) as usize).step_by(k as usize) {
            markers.push_back(RetentionMarker {
                records: est_records_per_marker,
                bytes: est_bytes_per_marker,
                last_record: *last_record,
            });
        }
        let created = markers.len() as i64;
        drop(markers);

        self.current_records.store(
            (num_records - est_records_per_marker * created).max(0),
            Ordering::SeqCst,
        );
        self.current_bytes.store(
            (data_size - est_bytes_per_marker * created).max(0),
            Ordering::SeqCst,
        );
        info!(ns = %self.ns, markers = created, "placed markers by sampling");
        Ok(true)
    }
}

// =============================================================================
// Insert Hook
// =============================================================================

/// Feeds committed inserts into the open segment
pub(crate) struct MarkerInsert {
    markers: Arc<RetentionMarkers>,
    inserted: Vec<(RecordId, i64)>,
}

impl MarkerInsert {
    pub(crate) fn new(markers: Arc<RetentionMarkers>, inserted: Vec<(RecordId, i64)>) -> Self {
        Self { markers, inserted }
    }
}

impl Change for MarkerInsert {
    fn commit(self: Box<Self>) {
        self.markers.record_inserts(&self.inserted);
    }

    fn rollback(self: Box<Self>) {}
}

// =============================================================================
// Reclaim
// =============================================================================

/// Truncate excess markers oldest first; returns how many were reclaimed
pub(crate) fn reclaim(store: &Arc<StoreInner>) -> Result<usize> {
    let Some(markers) = &store.markers else {
        return Ok(0);
    };
    let _reclaiming = markers.reclaim_lock.lock();
    let format = store.key_format;
    let mut reclaimed = 0usize;

    while let Some(marker) = markers.peek_oldest_marker_if_needed() {
        let backoff = Backoff::new();
        loop {
            let mut ru = RecoveryUnit::new(Arc::clone(&store.kv));
            let first = markers.first_record();
            let start = if first.is_null() {
                format.range().0
            } else {
                format.encode(first)
            };
            let end = format.encode(marker.last_record);

            let attempt = (|| -> Result<()> {
                ru.session()?.truncate(
                    &store.table,
                    Bound::Included(start.as_slice()),
                    Bound::Included(end.as_slice()),
                )?;
                store.change_num_records(&mut ru, -marker.records);
                store.increase_data_size(&mut ru, -marker.bytes);
                ru.commit()
            })();

            match attempt {
                Ok(()) => break,
                Err(AtlasError::WriteConflict) => {
                    warn!(ns = %store.ns, "write conflict while truncating log, retrying");
                    if markers.is_dead() {
                        return Ok(reclaimed);
                    }
                    backoff.snooze();
                }
                Err(e) => return Err(e),
            }
        }

        markers.pop_oldest_marker();
        markers.set_first_record(marker.last_record);
        reclaimed += 1;
        info!(
            ns = %store.ns,
            last_record = %marker.last_record,
            records = marker.records,
            bytes = marker.bytes,
            "reclaimed log marker"
        );

        if store.is_shutting_down() {
            break;
        }
    }
    Ok(reclaimed)
}

/// Background thread truncating excess markers of one log store
pub(crate) struct ReclaimThread {
    markers: Arc<RetentionMarkers>,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimThread {
    pub(crate) fn spawn(store: Arc<StoreInner>) -> Result<Self> {
        let markers = store.markers.clone().ok_or_else(|| {
            AtlasError::IllegalOperation(format!("{} is not a log collection", store.ns))
        })?;

        let handle = thread::Builder::new()
            .name(format!("reclaim-{}", store.ns))
            .spawn(move || Self::run(store))?;

        Ok(Self {
            markers,
            handle: Some(handle),
        })
    }

    fn run(store: Arc<StoreInner>) {
        let Some(markers) = store.markers.clone() else {
            return;
        };
        info!(ns = %store.ns, "log reclaim thread started");

        while markers.await_has_excess_markers_or_dead() {
            if let Err(e) = reclaim(&store) {
                error!(ns = %store.ns, error = %e, "log reclaim failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
        info!(ns = %store.ns, "log reclaim thread stopped");
    }

    /// Kill the waiter and join the thread
    pub(crate) fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.markers.kill();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(ns = %self.markers.ns, "log reclaim thread panicked");
            }
        }
    }
}

impl Drop for ReclaimThread {
    fn drop(&mut self) {
        self.stop();
    }
}
