//! Record Store
//!
//! CRUD, id assignment and rollback-safe counters for one collection.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{CollectionOptions, Config};
use crate::cursor::{RandomCursor, RecordCursor};
use crate::error::{AtlasError, Result};
use crate::kv::{Direction, KvEngine};
use crate::record::{extract_log_key, KeyFormat, LogTimestamp, Record, RecordId};
use crate::txn::{Change, RecoveryUnit};

use super::capped::{self, CappedCallback, CappedReclaimer};
use super::markers::{self, MarkerInsert, MarkerStats, ReclaimThread, RetentionMarkers};
use super::size_storer::SizeStorer;
use super::validate::{self, RecordValidator, ValidateLevel, ValidateResults};

// =============================================================================
// Table Metadata
// =============================================================================

/// Oldest record format this build reads
pub const MIN_FORMAT_VERSION: u32 = 1;

/// Newest record format this build reads (and the one it writes)
pub const MAX_FORMAT_VERSION: u32 = 1;

/// Required log key extraction version for log tables
pub const LOG_KEY_VERSION: u32 = 1;

/// Per-table metadata stored in the engine's metadata area
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub format_version: u32,
    pub log_key_version: Option<u32>,
    pub prefixed: bool,
}

impl TableMetadata {
    pub fn for_options(options: &CollectionOptions) -> Self {
        Self {
            format_version: MAX_FORMAT_VERSION,
            log_key_version: options.log.then_some(LOG_KEY_VERSION),
            prefixed: options.prefix.is_some(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw).map_err(|e| AtlasError::MetadataParse(e.to_string()))
    }

    /// Refuse formats this build does not understand
    pub fn check_compatible(&self, log: bool) -> Result<()> {
        if self.format_version < MIN_FORMAT_VERSION || self.format_version > MAX_FORMAT_VERSION {
            return Err(AtlasError::IncompatibleFormat {
                found: self.format_version,
                min: MIN_FORMAT_VERSION,
                max: MAX_FORMAT_VERSION,
            });
        }
        if log && self.log_key_version != Some(LOG_KEY_VERSION) {
            return Err(AtlasError::IncompatibleFormat {
                found: self.log_key_version.unwrap_or(0),
                min: LOG_KEY_VERSION,
                max: LOG_KEY_VERSION,
            });
        }
        Ok(())
    }
}

/// Byte-range patch applied by [`RecordStore::update_in_place`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Damage {
    pub source_offset: usize,
    pub target_offset: usize,
    pub size: usize,
}

/// Snapshot of a store's settings and counters
#[derive(Debug, Clone, Serialize)]
pub struct RecordStoreStats {
    pub ns: String,
    pub table: String,
    pub capped: bool,
    pub log: bool,
    pub max_size: Option<i64>,
    pub max_docs: Option<i64>,
    pub sleep_count: u64,
    pub sleep_ms: u64,
    pub count: i64,
    pub size: i64,
    pub scale: i64,
    pub format_version: u32,
    pub prefixed: bool,
    pub markers: Option<MarkerStats>,
}

/// Size-cache key of the store described by `options`
pub(crate) fn size_key_for(options: &CollectionOptions) -> String {
    match options.prefix {
        Some(prefix) => format!("{}#{}", options.table, prefix),
        None => options.table.clone(),
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// State shared between the store handle, commit hooks, cursors and the
/// reclaim thread
pub(crate) struct StoreInner {
    pub(crate) ns: String,
    pub(crate) table: String,
    /// Size-cache key; unique per store even when tables are shared
    pub(crate) size_key: String,
    pub(crate) key_format: KeyFormat,
    pub(crate) capped: bool,
    pub(crate) log: bool,
    pub(crate) max_docs: Option<i64>,
    pub(crate) metadata: TableMetadata,
    pub(crate) config: Arc<Config>,
    pub(crate) kv: Arc<dyn KvEngine>,
    pub(crate) reclaimer: Option<CappedReclaimer>,
    pub(crate) markers: Option<Arc<RetentionMarkers>>,

    max_size: AtomicI64,
    size_storer: Option<Arc<SizeStorer>>,
    num_records: AtomicI64,
    data_size: AtomicI64,
    size_updates: AtomicU64,
    next_id: AtomicI64,
    highest_log_id: AtomicI64,
    capped_callback: RwLock<Option<Arc<dyn CappedCallback>>>,
    shutting_down: AtomicBool,
}

/// Undoes a record-count change on rollback
struct NumRecordsChange {
    store: Arc<StoreInner>,
    diff: i64,
}

impl Change for NumRecordsChange {
    fn commit(self: Box<Self>) {}

    fn rollback(self: Box<Self>) {
        self.store.num_records.fetch_sub(self.diff, Ordering::SeqCst);
    }
}

/// Undoes a data-size change on rollback
struct DataSizeChange {
    store: Arc<StoreInner>,
    amount: i64,
}

impl Change for DataSizeChange {
    fn commit(self: Box<Self>) {}

    fn rollback(self: Box<Self>) {
        self.store.data_size.fetch_sub(self.amount, Ordering::SeqCst);
    }
}

impl StoreInner {
    pub(crate) fn num_records(&self) -> i64 {
        self.num_records.load(Ordering::SeqCst)
    }

    pub(crate) fn data_size(&self) -> i64 {
        self.data_size.load(Ordering::SeqCst)
    }

    pub(crate) fn max_size(&self) -> i64 {
        self.max_size.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn capped_callback(&self) -> Option<Arc<dyn CappedCallback>> {
        self.capped_callback.read().clone()
    }

    /// Adjust the record count, undone if `ru` rolls back
    pub(crate) fn change_num_records(self: &Arc<Self>, ru: &mut RecoveryUnit, diff: i64) {
        ru.register_change(Box::new(NumRecordsChange {
            store: Arc::clone(self),
            diff,
        }));
        let old = self.num_records.fetch_add(diff, Ordering::SeqCst);
        if old + diff < 0 {
            self.num_records.store(diff.max(0), Ordering::SeqCst);
        }
    }

    /// Adjust the data size, undone if `ru` rolls back
    pub(crate) fn increase_data_size(self: &Arc<Self>, ru: &mut RecoveryUnit, amount: i64) {
        ru.register_change(Box::new(DataSizeChange {
            store: Arc::clone(self),
            amount,
        }));
        let old = self.data_size.fetch_add(amount, Ordering::SeqCst);
        if old + amount < 0 {
            self.data_size.store(amount.max(0), Ordering::SeqCst);
        }

        if let Some(storer) = &self.size_storer {
            let every = self.config.size_storer_sync_interval.max(1);
            if self.size_updates.fetch_add(1, Ordering::Relaxed) % every == 0 {
                storer.store(&self.size_key, self.num_records(), self.data_size());
            }
        }
    }

    /// Replace the counters with scanned totals
    pub(crate) fn update_stats_after_repair(&self, num_records: i64, data_size: i64) {
        self.num_records.store(num_records, Ordering::SeqCst);
        self.data_size.store(data_size, Ordering::SeqCst);
        if let Some(storer) = &self.size_storer {
            storer.store(&self.size_key, num_records, data_size);
        }
    }

    pub(crate) fn sync_size_storer(&self) {
        if let Some(storer) = &self.size_storer {
            storer.store(&self.size_key, self.num_records(), self.data_size());
        }
    }

    fn needs_capped_delete(&self) -> bool {
        if !self.capped || self.log {
            return false;
        }
        if self.data_size() >= self.max_size() {
            return true;
        }
        matches!(self.max_docs, Some(max) if self.num_records() > max)
    }

    /// Run the capped reclaimer if the store is over its limits
    pub(crate) fn capped_delete_as_needed(self: &Arc<Self>, just_inserted: RecordId) -> Result<i64> {
        match &self.reclaimer {
            Some(reclaimer) if self.needs_capped_delete() => {
                reclaimer.delete_as_needed(self, just_inserted)
            }
            _ => Ok(0),
        }
    }

    /// Reclaim after `ru` commits; failures are logged, never surfaced
    fn capped_delete_on_commit(self: &Arc<Self>, ru: &mut RecoveryUnit, just_inserted: RecordId) {
        if self.reclaimer.is_none() {
            return;
        }
        let store = Arc::clone(self);
        ru.on_commit(move || {
            if let Err(e) = store.capped_delete_as_needed(just_inserted) {
                error!(ns = %store.ns, error = %e, "capped deletion failed");
            }
        });
    }

    /// Wake tailing readers through the capped callback, if one is set
    pub(crate) fn notify_capped_waiters(&self) {
        if let Some(callback) = self.capped_callback() {
            callback.notify_capped_waiters_if_needed();
        }
    }

    /// Newest record id in the store, if any
    fn last_record_id(&self, ru: &mut RecoveryUnit) -> Result<Option<RecordId>> {
        let (_, hi) = self.key_format.range();
        let entry = ru
            .session()?
            .scan_next(&self.table, Bound::Included(hi.as_slice()), Direction::Backward)?;
        match entry {
            Some(entry) if self.key_format.owns(&entry.key) => {
                Ok(Some(self.key_format.decode(&entry.key)?))
            }
            _ => Ok(None),
        }
    }

    /// Count records and bytes with a full scan
    fn scan_totals(self: &Arc<Self>, ru: &mut RecoveryUnit) -> Result<(i64, i64)> {
        let mut cursor = RecordCursor::new(Arc::clone(self), true);
        let (mut records, mut bytes) = (0i64, 0i64);
        while let Some(record) = cursor.next(ru)? {
            records += 1;
            bytes += record.len() as i64;
        }
        Ok((records, bytes))
    }

    fn assign_log_ids(self: &Arc<Self>, ru: &mut RecoveryUnit, records: &[Bytes]) -> Result<Vec<RecordId>> {
        let ids = records
            .iter()
            .map(|data| extract_log_key(data))
            .collect::<Result<Vec<_>>>()?;

        for pair in ids.windows(2) {
            if pair[1] <= pair[0] {
                return Err(AtlasError::OutOfOrderLogId {
                    id: pair[1],
                    highest: pair[0],
                });
            }
        }

        let (first, last) = match (ids.first(), ids.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Ok(ids),
        };

        let previous = self
            .highest_log_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |highest| {
                (first.repr() > highest).then_some(last.repr())
            })
            .map_err(|highest| AtlasError::OutOfOrderLogId {
                id: first,
                highest: RecordId::new(highest),
            })?;

        // A rolled back batch gives its ids back so the caller can retry it
        let store = Arc::clone(self);
        ru.on_rollback(move || {
            let _ = store.highest_log_id.compare_exchange(
                last.repr(),
                previous,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        });

        Ok(ids)
    }
}

// =============================================================================
// Record Store
// =============================================================================

/// One collection stored in one key range of a key-value table
pub struct RecordStore {
    inner: Arc<StoreInner>,
    reclaim_thread: Mutex<Option<ReclaimThread>>,
}

impl RecordStore {
    /// Create the physical table for `options` and write its metadata
    ///
    /// Prefixed stores share tables: an existing prefixed table is reused.
    pub fn create_table(kv: &dyn KvEngine, options: &CollectionOptions) -> Result<()> {
        options.validate()?;
        let metadata = TableMetadata::for_options(options);

        if options.prefix.is_some() && kv.has_table(&options.table) {
            let existing = TableMetadata::decode(&kv.table_metadata(&options.table)?)?;
            if !existing.prefixed {
                return Err(AtlasError::BadValue(format!(
                    "table {} is not a prefixed table",
                    options.table
                )));
            }
            return Ok(());
        }

        kv.create_table(&options.table, &metadata.encode()?)?;
        debug!(ns = %options.ns, table = %options.table, "created record store table");
        Ok(())
    }

    /// Open the store described by `options` on an existing table
    pub fn open(
        config: Arc<Config>,
        kv: Arc<dyn KvEngine>,
        size_storer: Option<Arc<SizeStorer>>,
        options: &CollectionOptions,
    ) -> Result<Self> {
        config.validate()?;
        options.validate()?;

        let metadata = TableMetadata::decode(&kv.table_metadata(&options.table)?)?;
        metadata.check_compatible(options.log)?;
        if metadata.prefixed != options.prefix.is_some() {
            return Err(AtlasError::BadValue(format!(
                "table {} prefix setting does not match collection {}",
                options.table, options.ns
            )));
        }

        let key_format = KeyFormat::for_prefix(options.prefix);
        let size_key = size_key_for(options);
        let max_size = options.max_size.unwrap_or(0);

        let reclaimer = (options.capped && !options.log)
            .then(|| CappedReclaimer::new(max_size, config.capped_slack_ceiling));
        let markers = options
            .log
            .then(|| Arc::new(RetentionMarkers::new(&options.ns, &config, max_size)));

        let inner = Arc::new(StoreInner {
            ns: options.ns.clone(),
            table: options.table.clone(),
            size_key,
            key_format,
            capped: options.capped,
            log: options.log,
            max_docs: options.max_docs,
            metadata,
            config: Arc::clone(&config),
            kv: Arc::clone(&kv),
            reclaimer,
            markers,
            max_size: AtomicI64::new(max_size),
            size_storer,
            num_records: AtomicI64::new(0),
            data_size: AtomicI64::new(0),
            size_updates: AtomicU64::new(0),
            next_id: AtomicI64::new(1),
            highest_log_id: AtomicI64::new(0),
            capped_callback: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
        });

        let mut ru = RecoveryUnit::new(Arc::clone(&kv));

        if let Some(last) = inner.last_record_id(&mut ru)? {
            inner.next_id.store(last.repr() + 1, Ordering::SeqCst);
            if inner.log {
                inner.highest_log_id.store(last.repr(), Ordering::SeqCst);
            }
        }

        let cached = inner
            .size_storer
            .as_ref()
            .and_then(|storer| storer.load(&inner.size_key));
        match cached {
            Some(info) => {
                inner.num_records.store(info.num_records, Ordering::SeqCst);
                inner.data_size.store(info.data_size, Ordering::SeqCst);
            }
            None => {
                let (records, bytes) = inner.scan_totals(&mut ru)?;
                inner.update_stats_after_repair(records, bytes);
            }
        }

        if let Some(markers) = &inner.markers {
            if let Some(bytes) = options.min_bytes_per_marker {
                if inner.num_records() == 0 {
                    markers.set_min_bytes_per_marker(bytes);
                }
            }
            markers.initialize(&mut ru, &inner)?;
        }
        ru.abort();

        let reclaim_thread = if inner.log && config.background_reclaim {
            Some(ReclaimThread::spawn(Arc::clone(&inner))?)
        } else {
            None
        };

        info!(
            ns = %inner.ns,
            table = %inner.table,
            capped = inner.capped,
            log = inner.log,
            records = inner.num_records(),
            bytes = inner.data_size(),
            "opened record store"
        );

        Ok(Self {
            inner,
            reclaim_thread: Mutex::new(reclaim_thread),
        })
    }

    pub fn ns(&self) -> &str {
        &self.inner.ns
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn key_format(&self) -> KeyFormat {
        self.inner.key_format
    }

    pub(crate) fn size_key(&self) -> &str {
        &self.inner.size_key
    }

    pub fn is_capped(&self) -> bool {
        self.inner.capped
    }

    pub fn is_log(&self) -> bool {
        self.inner.log
    }

    pub fn max_size(&self) -> Option<i64> {
        self.inner.capped.then(|| self.inner.max_size())
    }

    pub fn max_docs(&self) -> Option<i64> {
        self.inner.max_docs
    }

    /// Approximate number of records
    pub fn num_records(&self) -> i64 {
        self.inner.num_records()
    }

    /// Approximate total payload bytes
    pub fn data_size(&self) -> i64 {
        self.inner.data_size()
    }

    /// Bytes the store occupies on disk
    ///
    /// An empty capped store reports 1 so callers never treat it as absent.
    pub fn storage_size(&self) -> i64 {
        match self.inner.data_size() {
            0 if self.inner.capped => 1,
            size => size,
        }
    }

    /// Marker bookkeeping of a log store
    pub fn retention_markers(&self) -> Option<Arc<RetentionMarkers>> {
        self.inner.markers.clone()
    }

    /// Hook invoked for every record about to be deleted by capped deletion
    /// or `truncate_after`
    pub fn set_capped_callback(&self, callback: Option<Arc<dyn CappedCallback>>) {
        *self.inner.capped_callback.write() = callback;
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a batch of records; returns their ids in input order
    ///
    /// `timestamps` is either empty or one per record (null = unstamped).
    pub fn insert(
        &self,
        ru: &mut RecoveryUnit,
        records: &[Bytes],
        timestamps: &[LogTimestamp],
    ) -> Result<Vec<RecordId>> {
        let store = &self.inner;

        if !timestamps.is_empty() && timestamps.len() != records.len() {
            return Err(AtlasError::BadValue(format!(
                "{} timestamps given for {} records",
                timestamps.len(),
                records.len()
            )));
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let total: i64 = records.iter().map(|r| r.len() as i64).sum();
        if store.capped && total > store.max_size() {
            return Err(AtlasError::BadValue(format!(
                "batch of {} bytes exceeds capped max size {}",
                total,
                store.max_size()
            )));
        }

        let ids = if store.log {
            store.assign_log_ids(ru, records)?
        } else {
            let n = records.len() as i64;
            let start = store.next_id.fetch_add(n, Ordering::SeqCst);
            (start..start + n).map(RecordId::new).collect()
        };

        for (i, (id, data)) in ids.iter().zip(records).enumerate() {
            let ts = match timestamps.get(i) {
                Some(ts) if !ts.is_null() => Some(ts.as_u64()),
                _ if store.log => Some(id.repr() as u64),
                _ => None,
            };
            let session = ru.session()?;
            if let Some(ts) = ts {
                session.set_timestamp(ts)?;
            }
            session.insert(&store.table, &store.key_format.encode(*id), data)?;
        }

        store.change_num_records(ru, ids.len() as i64);
        store.increase_data_size(ru, total);

        if let Some(markers) = &store.markers {
            let inserted = ids
                .iter()
                .zip(records)
                .map(|(id, data)| (*id, data.len() as i64))
                .collect();
            ru.register_change(Box::new(MarkerInsert::new(Arc::clone(markers), inserted)));
        } else if let Some(last) = ids.last() {
            store.capped_delete_on_commit(ru, *last);
        }
        if store.capped {
            let inner = Arc::clone(store);
            ru.on_commit(move || inner.notify_capped_waiters());
        }

        debug!(ns = %store.ns, records = ids.len(), bytes = total, "inserted records");
        Ok(ids)
    }

    /// Insert one record
    pub fn insert_record(
        &self,
        ru: &mut RecoveryUnit,
        data: impl Into<Bytes>,
        ts: LogTimestamp,
    ) -> Result<RecordId> {
        let ids = self.insert(ru, &[data.into()], &[ts])?;
        ids.into_iter()
            .next()
            .ok_or_else(|| AtlasError::BadValue("insert returned no id".into()))
    }

    /// Replace the payload of `id`
    pub fn update(&self, ru: &mut RecoveryUnit, id: RecordId, data: &[u8]) -> Result<()> {
        let store = &self.inner;
        let key = store.key_format.encode(id);
        let old = ru
            .session()?
            .get(&store.table, &key)?
            .ok_or(AtlasError::RecordNotFound(id))?;

        if store.log && old.len() != data.len() {
            return Err(AtlasError::IllegalOperation(format!(
                "cannot change the size of log record {} ({} -> {} bytes)",
                id,
                old.len(),
                data.len()
            )));
        }

        ru.session()?.insert(&store.table, &key, data)?;
        store.increase_data_size(ru, data.len() as i64 - old.len() as i64);
        store.capped_delete_on_commit(ru, id);
        Ok(())
    }

    /// Patch byte ranges of `id` from `source`; returns the new payload
    pub fn update_in_place(
        &self,
        ru: &mut RecoveryUnit,
        id: RecordId,
        source: &[u8],
        damages: &[Damage],
    ) -> Result<Bytes> {
        let store = &self.inner;
        let key = store.key_format.encode(id);
        let old = ru
            .session()?
            .get(&store.table, &key)?
            .ok_or(AtlasError::RecordNotFound(id))?;

        let mut data = old.clone();
        for damage in damages {
            let source_end = damage.source_offset.checked_add(damage.size).ok_or_else(|| {
                AtlasError::BadValue(format!(
                    "damage source offset {} + size {} overflows",
                    damage.source_offset, damage.size
                ))
            })?;
            let target_end = damage.target_offset.checked_add(damage.size).ok_or_else(|| {
                AtlasError::BadValue(format!(
                    "damage target offset {} + size {} overflows",
                    damage.target_offset, damage.size
                ))
            })?;
            if source_end > source.len() {
                return Err(AtlasError::BadValue(format!(
                    "damage source range {}..{} exceeds {} source bytes",
                    damage.source_offset,
                    source_end,
                    source.len()
                )));
            }
            if target_end > data.len() {
                if store.log {
                    return Err(AtlasError::IllegalOperation(format!(
                        "cannot grow log record {}",
                        id
                    )));
                }
                data.resize(target_end, 0);
            }
            data[damage.target_offset..target_end]
                .copy_from_slice(&source[damage.source_offset..source_end]);
        }

        ru.session()?.insert(&store.table, &key, &data)?;
        store.increase_data_size(ru, data.len() as i64 - old.len() as i64);
        store.capped_delete_on_commit(ru, id);
        Ok(Bytes::from(data))
    }

    /// Delete one record; not allowed on capped stores
    pub fn delete(&self, ru: &mut RecoveryUnit, id: RecordId) -> Result<()> {
        let store = &self.inner;
        if store.capped {
            return Err(AtlasError::IllegalOperation(format!(
                "cannot remove a document from capped collection {}",
                store.ns
            )));
        }

        let key = store.key_format.encode(id);
        let session = ru.session()?;
        let old = session
            .get(&store.table, &key)?
            .ok_or(AtlasError::RecordNotFound(id))?;
        session.remove(&store.table, &key)?;

        store.change_num_records(ru, -1);
        store.increase_data_size(ru, -(old.len() as i64));
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn find_by_id(&self, ru: &mut RecoveryUnit, id: RecordId) -> Result<Option<Record>> {
        let store = &self.inner;
        let value = ru
            .session()?
            .get(&store.table, &store.key_format.encode(id))?;
        Ok(value.map(|data| Record::with_id(id, data)))
    }

    /// Ordered cursor over every record
    pub fn cursor(&self, forward: bool) -> RecordCursor {
        RecordCursor::new(Arc::clone(&self.inner), forward)
    }

    /// Cursor returning uniformly sampled records
    pub fn random_cursor(&self) -> RandomCursor {
        RandomCursor::new(Arc::clone(&self.inner))
    }

    /// For log stores, the greatest id `<= start` (null id when none)
    pub fn log_start_position(
        &self,
        ru: &mut RecoveryUnit,
        start: RecordId,
    ) -> Result<Option<RecordId>> {
        let store = &self.inner;
        if !store.log {
            return Ok(None);
        }

        let key = store.key_format.encode(start);
        let entry = ru
            .session()?
            .scan_next(&store.table, Bound::Included(key.as_slice()), Direction::Backward)?;
        match entry {
            Some(entry) if store.key_format.owns(&entry.key) => {
                Ok(Some(store.key_format.decode(&entry.key)?))
            }
            _ => Ok(Some(RecordId::NULL)),
        }
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Remove every record
    pub fn truncate(&self, ru: &mut RecoveryUnit) -> Result<()> {
        let store = &self.inner;
        let (lo, hi) = store.key_format.range();
        let removed = ru.session()?.truncate(
            &store.table,
            Bound::Included(lo.as_slice()),
            Bound::Included(hi.as_slice()),
        )?;

        store.change_num_records(ru, -store.num_records());
        store.increase_data_size(ru, -store.data_size());

        if let Some(markers) = &store.markers {
            markers.clear_on_commit(ru);
        }
        if store.reclaimer.is_some() {
            let inner = Arc::clone(store);
            ru.on_commit(move || {
                if let Some(reclaimer) = &inner.reclaimer {
                    reclaimer.reset_first_record();
                }
            });
        }

        debug!(ns = %store.ns, removed, "truncated record store");
        Ok(())
    }

    /// Remove every record after `end` (and `end` itself when `inclusive`)
    ///
    /// Runs in its own unit of work. For the log this also rewinds the
    /// engine's oldest timestamp to the last kept record.
    pub fn truncate_after(&self, end: RecordId, inclusive: bool) -> Result<()> {
        let store = &self.inner;
        let format = store.key_format;
        let mut ru = RecoveryUnit::new(Arc::clone(&store.kv));

        let end_key = format.encode(end);
        if ru.session()?.get(&store.table, &end_key)?.is_none() {
            return Err(AtlasError::RecordNotFound(end));
        }

        let last_kept = if inclusive {
            let before = ru.session()?.scan_next(
                &store.table,
                Bound::Excluded(end_key.as_slice()),
                Direction::Backward,
            )?;
            match before {
                Some(entry) if format.owns(&entry.key) => format.decode(&entry.key)?,
                _ => RecordId::NULL,
            }
        } else {
            end
        };

        let callback = store.capped_callback();
        let mut position = end_key;
        let mut include_position = inclusive;
        let mut first_removed = None;
        let (mut records_removed, mut bytes_removed) = (0i64, 0i64);

        loop {
            let from = if include_position {
                Bound::Included(position.as_slice())
            } else {
                Bound::Excluded(position.as_slice())
            };
            let entry = ru.session()?.scan_next(&store.table, from, Direction::Forward)?;
            let Some(entry) = entry.filter(|e| format.owns(&e.key)) else {
                break;
            };

            let id = format.decode(&entry.key)?;
            if let Some(callback) = &callback {
                capped::run_callback(callback.as_ref(), &mut ru, id, &entry.value)?;
            }
            first_removed.get_or_insert(id);
            records_removed += 1;
            bytes_removed += entry.value.len() as i64;
            position = entry.key;
            include_position = false;
        }

        let Some(first_removed) = first_removed else {
            return Ok(());
        };

        let start = format.encode(first_removed);
        let (_, hi) = format.range();
        ru.session()?.truncate(
            &store.table,
            Bound::Included(start.as_slice()),
            Bound::Included(hi.as_slice()),
        )?;
        store.change_num_records(&mut ru, -records_removed);
        store.increase_data_size(&mut ru, -bytes_removed);
        ru.commit()?;

        if store.log {
            store.kv.set_oldest_timestamp(last_kept.repr().max(0) as u64);
            store.highest_log_id.store(last_kept.repr(), Ordering::SeqCst);
        }
        if let Some(markers) = &store.markers {
            markers.update_after_truncate_after(records_removed, bytes_removed, first_removed);
            if markers.first_record() >= first_removed {
                markers.set_first_record(RecordId::NULL);
            }
        }
        if let Some(reclaimer) = &store.reclaimer {
            if reclaimer.first_record() >= first_removed {
                reclaimer.reset_first_record();
            }
        }

        info!(
            ns = %store.ns,
            end = %end,
            inclusive,
            records_removed,
            bytes_removed,
            "truncated records after position"
        );
        Ok(())
    }

    /// Release the snapshot and let the engine reclaim space
    pub fn compact(&self, ru: &mut RecoveryUnit) -> Result<()> {
        ru.abandon_snapshot()?;
        self.inner.kv.compact(&self.inner.table)
    }

    /// Check structure and records; repairs counters when valid
    pub fn validate(
        &self,
        ru: &mut RecoveryUnit,
        level: ValidateLevel,
        validator: &dyn RecordValidator,
    ) -> Result<ValidateResults> {
        validate::validate_store(&self.inner, ru, level, validator)
    }

    /// Stats snapshot, byte values divided by `scale`
    pub fn append_stats(&self, scale: i64) -> RecordStoreStats {
        let store = &self.inner;
        let scale = scale.max(1);
        let (sleep_count, sleep_ms) = store
            .reclaimer
            .as_ref()
            .map_or((0, 0), |r| r.sleep_stats());

        RecordStoreStats {
            ns: store.ns.clone(),
            table: store.table.clone(),
            capped: store.capped,
            log: store.log,
            max_size: store.capped.then(|| store.max_size() / scale),
            max_docs: store.max_docs,
            sleep_count,
            sleep_ms,
            count: store.num_records(),
            size: store.data_size() / scale,
            scale,
            format_version: store.metadata.format_version,
            prefixed: store.metadata.prefixed,
            markers: store.markers.as_ref().map(|m| m.stats()),
        }
    }

    // =========================================================================
    // Capped / Log Maintenance
    // =========================================================================

    /// Change the byte ceiling of a capped store
    pub fn update_capped_size(&self, size: i64) -> Result<()> {
        let store = &self.inner;
        if !store.capped {
            return Err(AtlasError::IllegalOperation(format!(
                "{} is not a capped collection",
                store.ns
            )));
        }
        if size <= 0 {
            return Err(AtlasError::BadValue(format!("capped size {} must be positive", size)));
        }

        store.max_size.store(size, Ordering::SeqCst);
        if let Some(reclaimer) = &store.reclaimer {
            reclaimer.set_max_size(size, store.config.capped_slack_ceiling);
        }
        if let Some(markers) = &store.markers {
            markers.adjust(size);
        }
        info!(ns = %store.ns, max_size = size, "updated capped size");
        Ok(())
    }

    /// Wake readers waiting for new records in a capped store
    pub fn notify_capped_waiters_if_needed(&self) {
        if self.inner.capped {
            self.inner.notify_capped_waiters();
        }
    }

    /// Run capped deletion now; returns the number of records removed
    pub fn capped_delete_as_needed(&self, just_inserted: RecordId) -> Result<i64> {
        self.inner.capped_delete_as_needed(just_inserted)
    }

    /// Truncate every excess log marker; returns how many were reclaimed
    pub fn reclaim_log(&self) -> Result<usize> {
        if !self.inner.log {
            return Err(AtlasError::IllegalOperation(format!(
                "{} is not a log collection",
                self.inner.ns
            )));
        }
        markers::reclaim(&self.inner)
    }

    /// Release the snapshot and block until there are markers to reclaim
    ///
    /// Returns false once the store is shutting down.
    pub fn yield_and_await_deletion_request(&self, ru: &mut RecoveryUnit) -> Result<bool> {
        let markers = self.inner.markers.as_ref().ok_or_else(|| {
            AtlasError::IllegalOperation(format!("{} is not a log collection", self.inner.ns))
        })?;
        ru.abandon_snapshot()?;
        Ok(markers.await_has_excess_markers_or_dead())
    }

    /// Stop background work and push counters to the size cache
    ///
    /// Idempotent; also called on drop.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(markers) = &self.inner.markers {
            markers.kill();
        }
        if let Some(thread) = self.reclaim_thread.lock().take() {
            thread.shutdown();
        }
        self.inner.sync_size_storer();
        debug!(ns = %self.inner.ns, "record store shut down");
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(storer) = &self.inner.size_storer {
            if let Err(e) = storer.flush() {
                warn!(ns = %self.inner.ns, error = %e, "failed to flush size cache");
            }
        }
    }
}
