//! Size Storer
//!
//! Cache of `(record count, data size)` per table so opening a store does not
//! require a full scan.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                        │
//! │   Magic: "ATSZ" (4) | Version: u16 (2)                   │
//! │   PayloadCRC: u32 (4) | PayloadLen: u32 (4)              │
//! ├──────────────────────────────────────────────────────────┤
//! │ Payload: bincode(Vec<(table, SizeInfo)>)                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is best-effort: a missing or damaged file starts an empty
//! cache, and write failures are logged by the caller and never surfaced to
//! record-store operations.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AtlasError, Result};

const MAGIC: &[u8; 4] = b"ATSZ";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 14;

/// Cached counters for one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub num_records: i64,
    pub data_size: i64,
}

/// Per-table size cache, optionally persisted to a file
pub struct SizeStorer {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, SizeInfo>>,
    dirty: AtomicBool,
}

impl SizeStorer {
    /// A cache that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Open the cache backed by `path`, loading whatever can be read
    pub fn open(path: &Path) -> Self {
        let entries = match Self::read_file(path) {
            Ok(Some(entries)) => {
                debug!(path = %path.display(), tables = entries.len(), "loaded size cache");
                entries
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable size cache");
                HashMap::new()
            }
        };

        Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    /// Cached counters for `table`, if any
    pub fn load(&self, table: &str) -> Option<SizeInfo> {
        self.entries.read().get(table).copied()
    }

    pub fn store(&self, table: &str, num_records: i64, data_size: i64) {
        self.entries.write().insert(
            table.to_string(),
            SizeInfo {
                num_records,
                data_size,
            },
        );
        self.dirty.store(true, Ordering::Release);
    }

    /// A new table starts with zeroed counters
    pub fn on_create(&self, table: &str) {
        self.store(table, 0, 0);
    }

    pub fn on_destroy(&self, table: &str) {
        if self.entries.write().remove(table).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Write the cache to disk if it changed since the last flush
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut snapshot: Vec<(String, SizeInfo)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        if let Err(e) = Self::write_file(path, &snapshot) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(path = %path.display(), tables = snapshot.len(), "flushed size cache");
        Ok(())
    }

    fn write_file(path: &Path, entries: &[(String, SizeInfo)]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let payload = bincode::serialize(entries)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        // Write to a sibling file and rename so a crash never leaves a torn cache
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(MAGIC)?;
        file.write_all(&VERSION.to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Option<HashMap<String, SizeInfo>>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC {
            return Err(AtlasError::Corruption("bad size cache header".into()));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(AtlasError::Corruption(format!(
                "unsupported size cache version {}",
                version
            )));
        }

        let crc = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let len = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]) as usize;
        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + len)
            .ok_or_else(|| AtlasError::Corruption("truncated size cache".into()))?;

        if crc32fast::hash(payload) != crc {
            return Err(AtlasError::Corruption("size cache checksum mismatch".into()));
        }

        let entries: Vec<(String, SizeInfo)> = bincode::deserialize(payload)?;
        Ok(Some(entries.into_iter().collect()))
    }
}
