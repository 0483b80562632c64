//! # AtlasRS
//!
//! The keyed record-storage layer of a document database:
//! - Ordinary, capped and replication-log collections over an ordered
//!   transactional key-value engine
//! - Record id assignment (counter or embedded log timestamp)
//! - Approximate counters kept consistent with transaction rollback
//! - Capped collections bounded by back-pressured bulk deletion
//! - The log bounded by marker-based segment truncation on a background thread
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │          (store registry, size cache, recovery units)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                       RecordStore                            │
//! │        (ids, counters, truncate, validate, cursors)          │
//! └──────┬──────────────────────┬──────────────────────┬────────┘
//!        │                      │                      │
//!        ▼                      ▼                      ▼
//! ┌─────────────┐      ┌────────────────┐      ┌─────────────┐
//! │   Capped    │      │   Retention    │      │    Size     │
//! │  Reclaimer  │      │    Markers     │      │   Storer    │
//! └──────┬──────┘      │ + ReclaimThread│      └─────────────┘
//!        │             └───────┬────────┘
//!        ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            RecoveryUnit  →  KvEngine / KvSession             │
//! │                 (MemEngine: in-memory MVCC)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod kv;
pub mod txn;
pub mod record;
pub mod cursor;
pub mod store;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::{CollectionOptions, Config};
pub use cursor::{RandomCursor, RecordCursor};
pub use engine::Engine;
pub use kv::{KvEngine, KvSession, MemEngine};
pub use record::{LogTimestamp, Record, RecordId};
pub use store::{RecordStore, ValidateLevel};
pub use txn::{retry_on_write_conflict, RecoveryUnit};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasRS
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
