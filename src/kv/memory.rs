//! In-memory MVCC engine
//!
//! BTreeMap-based ordered tables with RwLock for concurrency.
//!
//! Every key holds a chain of versions tagged with the commit sequence that
//! produced them. A session reads the newest version at or below the
//! sequence current when it began, merged with its own buffered writes.
//! Commits are serialized by `commit_lock`; a session that writes a key
//! someone else committed after its snapshot fails with `WriteConflict`
//! (first committer wins).
//!
//! Writes remember the session timestamp in force when they were buffered.
//! Timestamps are bookkeeping only; visibility is decided by sequence.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::debug;

use crate::error::{AtlasError, Result};

use super::{Direction, KvEngine, KvEntry, KvSession, VerifyStatus};

/// One committed version of a key (`None` value = tombstone)
#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    value: Option<Vec<u8>>,
    timestamp: Option<u64>,
}

type Rows = BTreeMap<Vec<u8>, Vec<Version>>;

/// An ordered table
struct MemTable {
    metadata: Vec<u8>,
    rows: RwLock<Rows>,
    /// Sessions holding uncommitted writes on this table
    pending_writers: AtomicUsize,
}

/// Shared engine state
struct EngineInner {
    tables: RwLock<HashMap<String, Arc<MemTable>>>,
    /// Sequence of the most recent commit (snapshots read at or below it)
    committed_seq: AtomicU64,
    commit_lock: Mutex<()>,
    next_session_id: AtomicU64,
    /// Active snapshot sequences and how many sessions hold each
    snapshots: Mutex<BTreeMap<u64, usize>>,
    oldest_timestamp: AtomicU64,
    injected_conflicts: AtomicU64,
}

/// In-memory implementation of [`KvEngine`]
#[derive(Clone)]
pub struct MemEngine {
    inner: Arc<EngineInner>,
}

impl MemEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tables: RwLock::new(HashMap::new()),
                committed_seq: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                next_session_id: AtomicU64::new(1),
                snapshots: Mutex::new(BTreeMap::new()),
                oldest_timestamp: AtomicU64::new(0),
                injected_conflicts: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next `count` non-empty commits fail with a write conflict
    pub fn inject_write_conflicts(&self, count: u64) {
        self.inner.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of live (non-deleted) keys in the latest committed state
    pub fn live_key_count(&self, table: &str) -> Result<usize> {
        let table = self.inner.table(table)?;
        let rows = table.rows.read();
        Ok(rows
            .values()
            .filter(|versions| matches!(versions.last(), Some(v) if v.value.is_some()))
            .count())
    }

    /// Number of stored versions, including tombstones
    pub fn version_count(&self, table: &str) -> Result<usize> {
        let table = self.inner.table(table)?;
        let rows = table.rows.read();
        Ok(rows.values().map(Vec::len).sum())
    }

    /// Timestamp the newest committed version of `key` was written with
    pub fn latest_timestamp(&self, table: &str, key: &[u8]) -> Result<Option<u64>> {
        let table = self.inner.table(table)?;
        let rows = table.rows.read();
        Ok(rows
            .get(key)
            .and_then(|versions| versions.last())
            .and_then(|v| v.timestamp))
    }

    /// Sequence of the latest commit
    pub fn committed_seq(&self) -> u64 {
        self.inner.committed_seq.load(Ordering::SeqCst)
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInner {
    fn table(&self, name: &str) -> Result<Arc<MemTable>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AtlasError::TableNotFound(name.to_string()))
    }

    fn register_snapshot(&self, seq: u64) {
        *self.snapshots.lock().entry(seq).or_insert(0) += 1;
    }

    fn release_snapshot(&self, seq: u64) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&seq);
            }
        }
    }
}

impl KvEngine for MemEngine {
    fn create_table(&self, table: &str, metadata: &[u8]) -> Result<()> {
        let mut tables = self.inner.tables.write();
        if tables.contains_key(table) {
            return Err(AtlasError::TableExists(table.to_string()));
        }
        tables.insert(
            table.to_string(),
            Arc::new(MemTable {
                metadata: metadata.to_vec(),
                rows: RwLock::new(BTreeMap::new()),
                pending_writers: AtomicUsize::new(0),
            }),
        );
        debug!(table, "created table");
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        match self.inner.tables.write().remove(table) {
            Some(_) => {
                debug!(table, "dropped table");
                Ok(())
            }
            None => Err(AtlasError::TableNotFound(table.to_string())),
        }
    }

    fn has_table(&self, table: &str) -> bool {
        self.inner.tables.read().contains_key(table)
    }

    fn table_metadata(&self, table: &str) -> Result<Vec<u8>> {
        Ok(self.inner.table(table)?.metadata.clone())
    }

    fn begin(&self) -> Result<Box<dyn KvSession>> {
        // Snapshot registration must not race with a commit publishing its
        // sequence, otherwise compaction could prune versions we can see.
        let snapshot = {
            let _guard = self.inner.commit_lock.lock();
            let seq = self.inner.committed_seq.load(Ordering::SeqCst);
            self.inner.register_snapshot(seq);
            seq
        };

        Ok(Box::new(MemSession {
            engine: Arc::clone(&self.inner),
            id: self.inner.next_session_id.fetch_add(1, Ordering::SeqCst),
            snapshot,
            writes: HashMap::new(),
            timestamp: None,
            finished: false,
        }))
    }

    fn compact(&self, table: &str) -> Result<()> {
        let table = self.inner.table(table)?;
        let horizon = {
            let snapshots = self.inner.snapshots.lock();
            snapshots
                .keys()
                .next()
                .copied()
                .unwrap_or_else(|| self.inner.committed_seq.load(Ordering::SeqCst))
        };

        let mut rows = table.rows.write();
        let mut pruned = 0usize;
        rows.retain(|_, versions| {
            // Keep the newest version every snapshot can still see, plus
            // everything newer than the horizon.
            if let Some(keep_from) = versions.iter().rposition(|v| v.seq <= horizon) {
                pruned += keep_from;
                versions.drain(..keep_from);
            }
            let dead = versions.len() == 1
                && versions[0].value.is_none()
                && versions[0].seq <= horizon;
            if dead {
                pruned += 1;
            }
            !dead
        });

        debug!(pruned, horizon, "compacted table");
        Ok(())
    }

    fn verify(&self, table: &str) -> Result<VerifyStatus> {
        let table = self.inner.table(table)?;
        if table.pending_writers.load(Ordering::SeqCst) > 0 {
            return Ok(VerifyStatus::Busy);
        }

        let rows = table.rows.read();
        for (key, versions) in rows.iter() {
            let ordered = versions.windows(2).all(|pair| pair[0].seq < pair[1].seq);
            if versions.is_empty() || !ordered {
                return Ok(VerifyStatus::Damaged(format!(
                    "bad version chain for key {:?}",
                    key
                )));
            }
        }
        Ok(VerifyStatus::Clean)
    }

    fn set_oldest_timestamp(&self, ts: u64) {
        self.inner.oldest_timestamp.store(ts, Ordering::SeqCst);
    }

    fn oldest_timestamp(&self) -> u64 {
        self.inner.oldest_timestamp.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Uncommitted writes against one table
struct TableWrites {
    table: Arc<MemTable>,
    rows: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    stamps: HashMap<Vec<u8>, u64>,
}

/// A snapshot-isolated session on a [`MemEngine`]
pub struct MemSession {
    engine: Arc<EngineInner>,
    id: u64,
    snapshot: u64,
    writes: HashMap<String, TableWrites>,
    timestamp: Option<u64>,
    finished: bool,
}

/// Newest value visible at `snapshot` (`Some(None)` = visible tombstone)
fn visible(versions: &[Version], snapshot: u64) -> Option<&Option<Vec<u8>>> {
    versions
        .iter()
        .rev()
        .find(|v| v.seq <= snapshot)
        .map(|v| &v.value)
}

/// Position of `key` in key space: its first 16 bytes, zero padded
fn key_point(key: &[u8]) -> u128 {
    let mut raw = [0u8; 16];
    let n = key.len().min(16);
    raw[..n].copy_from_slice(&key[..n]);
    u128::from_be_bytes(raw)
}

fn satisfies_lower(key: &[u8], bound: Bound<&[u8]>) -> bool {
    match bound {
        Bound::Included(b) => key >= b,
        Bound::Excluded(b) => key > b,
        Bound::Unbounded => true,
    }
}

fn satisfies_upper(key: &[u8], bound: Bound<&[u8]>) -> bool {
    match bound {
        Bound::Included(b) => key <= b,
        Bound::Excluded(b) => key < b,
        Bound::Unbounded => true,
    }
}

impl MemSession {
    fn conflict_check(&self, table: &MemTable, key: &[u8]) -> Result<()> {
        let rows = table.rows.read();
        if let Some(latest) = rows.get(key).and_then(|v| v.last()) {
            if latest.seq > self.snapshot {
                return Err(AtlasError::WriteConflict);
            }
        }
        Ok(())
    }

    fn buffer_write(&mut self, table: &str, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        let handle = match self.writes.get(table) {
            Some(w) => Arc::clone(&w.table),
            None => self.engine.table(table)?,
        };
        self.conflict_check(&handle, key)?;

        let timestamp = self.timestamp;
        let writes = self.writes.entry(table.to_string()).or_insert_with(|| {
            handle.pending_writers.fetch_add(1, Ordering::SeqCst);
            TableWrites {
                table: Arc::clone(&handle),
                rows: BTreeMap::new(),
                stamps: HashMap::new(),
            }
        });
        writes.rows.insert(key.to_vec(), value);
        match timestamp {
            Some(ts) => writes.stamps.insert(key.to_vec(), ts),
            None => writes.stamps.remove(key),
        };
        Ok(())
    }

    /// Every key visible to this session within the bounds, in order
    fn visible_keys(
        &self,
        table: &str,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.engine.table(table)?;
        let local = self.writes.get(table).map(|w| &w.rows);
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        let rows = handle.rows.read();
        for (key, versions) in rows.iter() {
            if !satisfies_lower(key, start) {
                continue;
            }
            if !satisfies_upper(key, end) {
                break;
            }
            if local.map_or(false, |w| w.contains_key(key)) {
                continue;
            }
            if let Some(Some(value)) = visible(versions, self.snapshot) {
                merged.insert(key.clone(), value.clone());
            }
        }
        drop(rows);

        if let Some(local) = local {
            for (key, value) in local.iter() {
                if let Some(value) = value {
                    if satisfies_lower(key, start) && satisfies_upper(key, end) {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        for writes in self.writes.values() {
            writes.table.pending_writers.fetch_sub(1, Ordering::SeqCst);
        }
        self.engine.release_snapshot(self.snapshot);
    }
}

impl KvSession for MemSession {
    fn snapshot_id(&self) -> u64 {
        self.id
    }

    fn get(&mut self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(local) = self.writes.get(table).and_then(|w| w.rows.get(key)) {
            return Ok(local.clone());
        }
        let handle = self.engine.table(table)?;
        let rows = handle.rows.read();
        Ok(rows
            .get(key)
            .and_then(|versions| visible(versions, self.snapshot))
            .and_then(|value| value.clone()))
    }

    fn insert(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.buffer_write(table, key, Some(value.to_vec()))
    }

    fn remove(&mut self, table: &str, key: &[u8]) -> Result<bool> {
        if self.get(table, key)?.is_none() {
            return Ok(false);
        }
        self.buffer_write(table, key, None)?;
        Ok(true)
    }

    fn scan_next(
        &mut self,
        table: &str,
        from: Bound<&[u8]>,
        direction: Direction,
    ) -> Result<Option<KvEntry>> {
        let handle = self.engine.table(table)?;
        let local = self.writes.get(table).map(|w| &w.rows);
        let shadowed = |key: &Vec<u8>| local.map_or(false, |w| w.contains_key(key));

        let rows = handle.rows.read();
        let committed = {
            let mut candidates: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<Version>)>> =
                match direction {
                    Direction::Forward => {
                        Box::new(rows.range::<[u8], _>((from, Bound::Unbounded)))
                    }
                    Direction::Backward => {
                        Box::new(rows.range::<[u8], _>((Bound::Unbounded, from)).rev())
                    }
                };
            candidates.find_map(|(key, versions)| {
                if shadowed(key) {
                    return None;
                }
                match visible(versions, self.snapshot) {
                    Some(Some(value)) => Some(KvEntry {
                        key: key.clone(),
                        value: value.clone(),
                    }),
                    _ => None,
                }
            })
        };
        drop(rows);

        let buffered = local.and_then(|w| {
            let mut candidates: Box<dyn Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)>> =
                match direction {
                    Direction::Forward => Box::new(w.range::<[u8], _>((from, Bound::Unbounded))),
                    Direction::Backward => {
                        Box::new(w.range::<[u8], _>((Bound::Unbounded, from)).rev())
                    }
                };
            candidates.find_map(|(key, value)| {
                value.as_ref().map(|value| KvEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
            })
        });

        Ok(match (committed, buffered) {
            (Some(a), Some(b)) => {
                let a_first = match direction {
                    Direction::Forward => a.key < b.key,
                    Direction::Backward => a.key > b.key,
                };
                Some(if a_first { a } else { b })
            }
            (a, b) => a.or(b),
        })
    }

    fn random_in(&mut self, table: &str, lo: &[u8], hi: &[u8]) -> Result<Option<KvEntry>> {
        if lo > hi {
            return Ok(None);
        }
        let first = match self.scan_next(table, Bound::Included(lo), Direction::Forward)? {
            Some(entry) if entry.key.as_slice() <= hi => entry,
            _ => return Ok(None),
        };
        let last = match self.scan_next(table, Bound::Included(hi), Direction::Backward)? {
            Some(entry) => entry,
            None => return Ok(Some(first)),
        };

        // Pick a point between the outermost keys and seek to it
        let (a, b) = (key_point(&first.key), key_point(&last.key));
        if a >= b {
            return Ok(Some(first));
        }
        let target = rand::thread_rng().gen_range(a..=b).to_be_bytes();
        let at = Bound::Included(target.as_slice());

        if let Some(entry) = self.scan_next(table, at, Direction::Forward)? {
            if entry.key.as_slice() <= hi {
                return Ok(Some(entry));
            }
        }
        match self.scan_next(table, at, Direction::Backward)? {
            Some(entry) if entry.key.as_slice() >= lo => Ok(Some(entry)),
            _ => Ok(Some(first)),
        }
    }

    fn truncate(&mut self, table: &str, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Result<u64> {
        let doomed = self.visible_keys(table, start, end)?;
        let mut removed = 0u64;
        for (key, _) in doomed {
            self.buffer_write(table, &key, None)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn set_timestamp(&mut self, ts: u64) -> Result<()> {
        self.timestamp = Some(ts);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if self.writes.is_empty() {
            self.finish();
            return Ok(());
        }

        let result = {
            let _guard = self.engine.commit_lock.lock();

            let injected = self
                .engine
                .injected_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            let conflicted = injected
                || self.writes.values().any(|w| {
                    let rows = w.table.rows.read();
                    w.rows.keys().any(|key| {
                        rows.get(key)
                            .and_then(|v| v.last())
                            .map_or(false, |latest| latest.seq > self.snapshot)
                    })
                });

            if conflicted {
                Err(AtlasError::WriteConflict)
            } else {
                let seq = self.engine.committed_seq.load(Ordering::SeqCst) + 1;
                for writes in self.writes.values() {
                    let mut rows = writes.table.rows.write();
                    for (key, value) in writes.rows.iter() {
                        rows.entry(key.clone()).or_default().push(Version {
                            seq,
                            value: value.clone(),
                            timestamp: writes.stamps.get(key).copied(),
                        });
                    }
                }
                self.engine.committed_seq.store(seq, Ordering::SeqCst);
                Ok(())
            }
        };

        if result.is_err() {
            debug!(session = self.id, "commit failed with write conflict");
        }
        self.finish();
        result
    }

    fn rollback(mut self: Box<Self>) {
        self.finish();
    }
}

impl Drop for MemSession {
    fn drop(&mut self) {
        self.finish();
    }
}
