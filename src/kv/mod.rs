//! Key-Value Engine Module
//!
//! The ordered, transactional key-value engine the record layer is built on.
//!
//! ## Responsibilities
//! - Named ordered tables with a per-table metadata blob
//! - Snapshot-isolated sessions; conflicting writers fail with
//!   [`AtlasError::WriteConflict`](crate::AtlasError::WriteConflict)
//! - Ordered seeks in both directions, range truncation, random sampling
//! - Structural verification and compaction hooks
//!
//! Record stores only see the [`KvEngine`] and [`KvSession`] traits; the
//! engine is injected at construction. [`MemEngine`] is the in-memory
//! implementation used by tests, benches and the workload tool.

mod memory;

use std::ops::Bound;

use crate::error::Result;

pub use memory::{MemEngine, MemSession};

/// A key/value pair returned by a seek
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Seek direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Outcome of a structural table check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
    /// No structural damage found
    Clean,
    /// The table is in use and could not be verified right now
    Busy,
    /// The table is damaged; individual records should not be trusted
    Damaged(String),
}

/// An ordered transactional key-value engine
pub trait KvEngine: Send + Sync {
    /// Create a table; fails with `TableExists` if the name is taken
    fn create_table(&self, table: &str, metadata: &[u8]) -> Result<()>;

    /// Drop a table and all of its data
    fn drop_table(&self, table: &str) -> Result<()>;

    fn has_table(&self, table: &str) -> bool;

    /// Metadata blob stored at creation
    fn table_metadata(&self, table: &str) -> Result<Vec<u8>>;

    /// Start a session reading from a fresh snapshot
    fn begin(&self) -> Result<Box<dyn KvSession>>;

    /// Reclaim space held by obsolete versions
    fn compact(&self, table: &str) -> Result<()>;

    /// Check the table's structure
    fn verify(&self, table: &str) -> Result<VerifyStatus>;

    /// Move the oldest timestamp readers may observe
    fn set_oldest_timestamp(&self, ts: u64);

    fn oldest_timestamp(&self) -> u64;
}

/// One snapshot-isolated transaction against a [`KvEngine`]
///
/// Reads observe the snapshot taken at `begin()` plus this session's own
/// writes. Writes are buffered until `commit()`.
pub trait KvSession: Send {
    /// Unique id of this session's snapshot
    fn snapshot_id(&self) -> u64;

    fn get(&mut self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite `key`
    fn insert(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`; returns false if it was not visible
    fn remove(&mut self, table: &str, key: &[u8]) -> Result<bool>;

    /// First entry after `from` going forward, or last entry before `from`
    /// going backward. `Unbounded` starts at the respective end of the table.
    fn scan_next(
        &mut self,
        table: &str,
        from: Bound<&[u8]>,
        direction: Direction,
    ) -> Result<Option<KvEntry>>;

    /// A uniformly sampled entry with `lo <= key <= hi`
    fn random_in(&mut self, table: &str, lo: &[u8], hi: &[u8]) -> Result<Option<KvEntry>>;

    /// Remove every visible key in the range; returns how many were removed
    fn truncate(&mut self, table: &str, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Result<u64>;

    /// Stamp this session's writes with a storage timestamp
    fn set_timestamp(&mut self, ts: u64) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>);
}
