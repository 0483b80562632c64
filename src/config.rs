//! Configuration for AtlasRS
//!
//! Centralized configuration with sensible defaults.
//!
//! - [`Config`] holds engine-wide tunables shared by every record store.
//! - [`CollectionOptions`] describes one collection (capped limits, log flag,
//!   key prefix) and is validated before a table is created.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AtlasError, Result};

/// Largest record the document layer will ever hand us (16 MiB + 16 KiB).
pub const MAX_RECORD_SIZE: i64 = 16 * 1024 * 1024 + 16 * 1024;

/// Main configuration for an AtlasRS instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Size Cache Configuration
    // -------------------------------------------------------------------------
    /// Root directory for files owned by the record layer
    /// Internal structure:
    ///   {data_dir}/
    ///     └── sizeStorer.bin   (cached record counts and data sizes)
    pub data_dir: PathBuf,

    /// Persist the size cache to `data_dir` (in-memory only when false)
    pub persist_sizes: bool,

    /// Push counters into the size cache every N data-size updates
    pub size_storer_sync_interval: u64,

    // -------------------------------------------------------------------------
    // Capped Collection Configuration
    // -------------------------------------------------------------------------
    /// Maximum documents removed by one capped deletion pass
    pub capped_delete_batch_limit: usize,

    /// How long a writer waits for the capped deleter before giving up (ms)
    pub capped_backpressure_wait_ms: u64,

    /// Upper bound for the allowed overage before writers are slowed down
    pub capped_slack_ceiling: i64,

    // -------------------------------------------------------------------------
    // Log Retention Configuration
    // -------------------------------------------------------------------------
    /// Lower bound on the number of markers kept for a log
    pub min_markers_to_keep: i64,

    /// Upper bound on the number of markers kept for a log
    pub max_markers_to_keep: i64,

    /// Random samples drawn per intended marker during cold start
    pub random_samples_per_marker: i64,

    /// Sampling is only used when the log holds at least this many times
    /// more records than the number of samples drawn
    pub min_sample_ratio: i64,

    /// Largest expected record, used to size markers
    pub max_record_size: i64,

    /// Run a background thread that truncates excess log markers
    pub background_reclaim: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlasrs_data"),
            persist_sizes: false,
            size_storer_sync_interval: 1000,
            capped_delete_batch_limit: 20_000,
            capped_backpressure_wait_ms: 200,
            capped_slack_ceiling: 16 * 1024 * 1024, // 16 MB
            min_markers_to_keep: 10,
            max_markers_to_keep: 100,
            random_samples_per_marker: 10,
            min_sample_ratio: 20,
            max_record_size: MAX_RECORD_SIZE,
            background_reclaim: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Back-pressure wait as a `Duration`
    pub fn capped_backpressure_wait(&self) -> Duration {
        Duration::from_millis(self.capped_backpressure_wait_ms)
    }

    /// Path of the persisted size cache
    pub fn size_storer_path(&self) -> PathBuf {
        self.data_dir.join("sizeStorer.bin")
    }

    /// Check tunables that would otherwise break marker sizing or deletion
    pub fn validate(&self) -> Result<()> {
        if self.min_markers_to_keep < 1 {
            return Err(AtlasError::Config(format!(
                "min markers to keep must be at least 1, got {}",
                self.min_markers_to_keep
            )));
        }
        if self.min_markers_to_keep > self.max_markers_to_keep {
            return Err(AtlasError::Config(format!(
                "min markers to keep {} exceeds max markers to keep {}",
                self.min_markers_to_keep, self.max_markers_to_keep
            )));
        }
        if self.random_samples_per_marker < 1 || self.min_sample_ratio < 0 {
            return Err(AtlasError::Config(
                "sampling needs at least one sample per marker and a non-negative ratio".into(),
            ));
        }
        if self.max_record_size < 1 {
            return Err(AtlasError::Config("max record size must be positive".into()));
        }
        if self.capped_delete_batch_limit == 0 {
            return Err(AtlasError::Config("capped delete batch limit must be positive".into()));
        }
        if self.capped_slack_ceiling < 0 {
            return Err(AtlasError::Config("capped slack ceiling must not be negative".into()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for the size cache file)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Enable or disable persisting the size cache
    pub fn persist_sizes(mut self, enabled: bool) -> Self {
        self.config.persist_sizes = enabled;
        self
    }

    /// Set how often counters are pushed into the size cache
    pub fn size_storer_sync_interval(mut self, every: u64) -> Self {
        self.config.size_storer_sync_interval = every.max(1);
        self
    }

    /// Set the per-pass capped deletion limit
    pub fn capped_delete_batch_limit(mut self, limit: usize) -> Self {
        self.config.capped_delete_batch_limit = limit;
        self
    }

    /// Set the capped back-pressure wait (in milliseconds)
    pub fn capped_backpressure_wait_ms(mut self, ms: u64) -> Self {
        self.config.capped_backpressure_wait_ms = ms;
        self
    }

    /// Set the ceiling of the capped slack window (in bytes)
    pub fn capped_slack_ceiling(mut self, bytes: i64) -> Self {
        self.config.capped_slack_ceiling = bytes;
        self
    }

    /// Set the bounds on the number of log markers to keep
    pub fn markers_to_keep(mut self, min: i64, max: i64) -> Self {
        self.config.min_markers_to_keep = min;
        self.config.max_markers_to_keep = max;
        self
    }

    /// Set the number of random samples per marker
    pub fn random_samples_per_marker(mut self, samples: i64) -> Self {
        self.config.random_samples_per_marker = samples;
        self
    }

    /// Set the minimum collection/sample ratio for sampling-based cold start
    pub fn min_sample_ratio(mut self, ratio: i64) -> Self {
        self.config.min_sample_ratio = ratio;
        self
    }

    /// Set the largest expected record size (in bytes)
    pub fn max_record_size(mut self, bytes: i64) -> Self {
        self.config.max_record_size = bytes;
        self
    }

    /// Enable or disable the background log reclaim thread
    pub fn background_reclaim(mut self, enabled: bool) -> Self {
        self.config.background_reclaim = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Collection Options
// =============================================================================

/// Options for one collection (one record store)
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    /// Logical namespace, e.g. `test.events` or `local.oplog.rs`
    pub ns: String,

    /// Physical table name in the key-value engine (defaults to `ns`)
    pub table: String,

    /// Fixed-capacity collection
    pub capped: bool,

    /// Byte ceiling for capped collections
    pub max_size: Option<i64>,

    /// Document ceiling for capped collections
    pub max_docs: Option<i64>,

    /// Append-only replication log (ids come from embedded timestamps)
    pub log: bool,

    /// Share a physical table with other collections under this prefix
    pub prefix: Option<i64>,

    /// Override the computed marker size (only honored on an empty log)
    pub min_bytes_per_marker: Option<i64>,
}

impl CollectionOptions {
    /// Create a new options builder for `ns`
    pub fn builder(ns: impl Into<String>) -> CollectionOptionsBuilder {
        let ns = ns.into();
        CollectionOptionsBuilder {
            options: CollectionOptions {
                table: ns.clone(),
                ns,
                ..Default::default()
            },
        }
    }

    /// Check the combination of flags and limits
    pub fn validate(&self) -> Result<()> {
        if self.ns.is_empty() || self.table.is_empty() {
            return Err(AtlasError::Config("namespace and table must be set".into()));
        }

        if self.capped {
            match self.max_size {
                Some(size) if size > 0 => {}
                _ => {
                    return Err(AtlasError::Config(format!(
                        "capped collection {} needs a positive max size",
                        self.ns
                    )))
                }
            }
            if let Some(docs) = self.max_docs {
                if docs <= 0 {
                    return Err(AtlasError::Config(format!(
                        "capped collection {} has non-positive max docs {}",
                        self.ns, docs
                    )));
                }
            }
        } else if self.max_size.is_some() || self.max_docs.is_some() {
            return Err(AtlasError::Config(format!(
                "collection {} sets capped limits without being capped",
                self.ns
            )));
        }

        if self.log && !self.capped {
            return Err(AtlasError::Config(format!(
                "log collection {} must be capped",
                self.ns
            )));
        }

        if let Some(bytes) = self.min_bytes_per_marker {
            if bytes <= 0 {
                return Err(AtlasError::Config("min bytes per marker must be positive".into()));
            }
        }

        Ok(())
    }
}

/// Builder for CollectionOptions
pub struct CollectionOptionsBuilder {
    options: CollectionOptions,
}

impl CollectionOptionsBuilder {
    /// Store records in a differently named physical table
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.options.table = table.into();
        self
    }

    /// Make the collection capped at `max_size` bytes
    pub fn capped(mut self, max_size: i64) -> Self {
        self.options.capped = true;
        self.options.max_size = Some(max_size);
        self
    }

    /// Also cap the number of documents
    pub fn max_docs(mut self, docs: i64) -> Self {
        self.options.max_docs = Some(docs);
        self
    }

    /// Mark the collection as the replication log
    pub fn log(mut self) -> Self {
        self.options.log = true;
        self
    }

    /// Share a physical table under `prefix`
    pub fn prefix(mut self, prefix: i64) -> Self {
        self.options.prefix = Some(prefix);
        self
    }

    /// Force the log marker size
    pub fn min_bytes_per_marker(mut self, bytes: i64) -> Self {
        self.options.min_bytes_per_marker = Some(bytes);
        self
    }

    pub fn build(self) -> CollectionOptions {
        self.options
    }
}
