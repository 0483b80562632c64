//! Engine Module
//!
//! Entry point that owns the key-value engine and every open record store.
//!
//! ## Responsibilities
//! - Hold the injected [`KvEngine`] and the shared [`SizeStorer`]
//! - Create, open and drop record stores
//! - Hand out recovery units
//! - Shut stores down (reclaim threads first) and flush cached sizes

use std::collections::HashMap;
use std::fs;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{CollectionOptions, Config};
use crate::error::{AtlasError, Result};
use crate::kv::{KvEngine, MemEngine};
use crate::store::{size_key_for, RecordStore, SizeStorer};
use crate::txn::{retry_on_write_conflict, RecoveryUnit};

/// The record layer over one key-value engine
///
/// ## Concurrency Model
///
/// - Store registry: `RwLock<HashMap>`; lookups share the read lock,
///   create/drop take the write lock
/// - Record stores are `Arc`-shared and internally synchronized
/// - Writes are optimistic: conflicting units fail with `WriteConflict` and
///   are retried by the caller (see [`retry_on_write_conflict`])
pub struct Engine {
    /// Engine configuration
    config: Arc<Config>,

    /// Injected ordered key-value engine
    kv: Arc<dyn KvEngine>,

    /// Cached counters for every store
    size_storer: Arc<SizeStorer>,

    /// Open stores by namespace
    stores: RwLock<HashMap<String, Arc<RecordStore>>>,
}

impl Engine {
    /// Open the record layer on `kv`
    ///
    /// With `persist_sizes` the size cache is loaded from (and later flushed
    /// to) `data_dir`.
    pub fn open(config: Config, kv: Arc<dyn KvEngine>) -> Result<Self> {
        config.validate()?;
        let size_storer = if config.persist_sizes {
            fs::create_dir_all(&config.data_dir)?;
            SizeStorer::open(&config.size_storer_path())
        } else {
            SizeStorer::in_memory()
        };

        info!(
            data_dir = %config.data_dir.display(),
            persist_sizes = config.persist_sizes,
            "engine opened"
        );

        Ok(Self {
            config: Arc::new(config),
            kv,
            size_storer: Arc::new(size_storer),
            stores: RwLock::new(HashMap::new()),
        })
    }

    /// Open on a fresh [`MemEngine`]
    pub fn open_in_memory(config: Config) -> Result<Self> {
        Self::open(config, Arc::new(MemEngine::new()))
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory and persisted sizes
    pub fn open_path(path: &Path, kv: Arc<dyn KvEngine>) -> Result<Self> {
        let config = Config::builder()
            .data_dir(path)
            .persist_sizes(true)
            .build();
        Self::open(config, kv)
    }

    /// New unit of work on this engine
    pub fn recovery_unit(&self) -> RecoveryUnit {
        RecoveryUnit::new(Arc::clone(&self.kv))
    }

    /// Create the table for `options` and open a store on it
    pub fn create_record_store(&self, options: &CollectionOptions) -> Result<Arc<RecordStore>> {
        options.validate()?;
        let mut stores = self.stores.write();
        if stores.contains_key(&options.ns) {
            return Err(AtlasError::TableExists(options.ns.clone()));
        }

        RecordStore::create_table(self.kv.as_ref(), options)?;
        self.size_storer.on_create(&size_key_for(options));
        let store = Arc::new(RecordStore::open(
            Arc::clone(&self.config),
            Arc::clone(&self.kv),
            Some(Arc::clone(&self.size_storer)),
            options,
        )?);
        stores.insert(options.ns.clone(), Arc::clone(&store));

        info!(ns = %options.ns, table = %options.table, "created record store");
        Ok(store)
    }

    /// Open a store on an existing table (or return it if already open)
    pub fn open_record_store(&self, options: &CollectionOptions) -> Result<Arc<RecordStore>> {
        let mut stores = self.stores.write();
        if let Some(store) = stores.get(&options.ns) {
            return Ok(Arc::clone(store));
        }

        let store = Arc::new(RecordStore::open(
            Arc::clone(&self.config),
            Arc::clone(&self.kv),
            Some(Arc::clone(&self.size_storer)),
            options,
        )?);
        stores.insert(options.ns.clone(), Arc::clone(&store));
        Ok(store)
    }

    pub fn get_record_store(&self, ns: &str) -> Option<Arc<RecordStore>> {
        self.stores.read().get(ns).cloned()
    }

    /// Shut a store down and delete its data
    pub fn drop_record_store(&self, ns: &str) -> Result<()> {
        let store = self
            .stores
            .write()
            .remove(ns)
            .ok_or_else(|| AtlasError::TableNotFound(ns.to_string()))?;

        store.shutdown();

        let format = store.key_format();
        if format.is_prefixed() {
            // The table is shared; only remove this store's key range
            let (lo, hi) = format.range();
            retry_on_write_conflict("drop_record_store", || {
                let mut ru = self.recovery_unit();
                ru.session()?.truncate(
                    store.table(),
                    Bound::Included(lo.as_slice()),
                    Bound::Included(hi.as_slice()),
                )?;
                ru.commit()
            })?;
        } else {
            self.kv.drop_table(store.table())?;
        }

        self.size_storer.on_destroy(store.size_key());
        if let Err(e) = self.size_storer.flush() {
            warn!(ns, error = %e, "failed to flush size cache");
        }
        info!(ns, "dropped record store");
        Ok(())
    }

    /// Shut every store down and flush the size cache
    pub fn close(self) -> Result<()> {
        let stores: Vec<_> = self.stores.write().drain().map(|(_, s)| s).collect();
        for store in &stores {
            store.shutdown();
        }
        drop(stores);

        if let Err(e) = self.size_storer.flush() {
            warn!(error = %e, "failed to flush size cache");
        }
        info!("engine closed");
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the injected key-value engine
    pub fn kv(&self) -> &Arc<dyn KvEngine> {
        &self.kv
    }

    /// Get the shared size cache
    pub fn size_storer(&self) -> &Arc<SizeStorer> {
        &self.size_storer
    }

    /// Namespaces of the open stores
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stores.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
