//! Record Store Module
//!
//! Maps one logical collection onto a table of the key-value engine.
//!
//! ## Responsibilities
//! - Assign record ids (counter or embedded log timestamp)
//! - Keep approximate record count / data size, rolled back with the unit
//!   of work that changed them
//! - Bound capped collections by deleting their oldest records
//! - Bound the replication log by truncating whole marker segments
//! - Check on-disk format versions at open
//!
//! ## Layout
//! ```text
//!   RecordStore ──┬── CappedReclaimer     (capped, non-log)
//!                 ├── RetentionMarkers    (log)
//!                 │     └── ReclaimThread (background truncation)
//!                 └── SizeStorer          (cached counters)
//! ```

mod capped;
mod markers;
mod record_store;
mod size_storer;
mod validate;

pub use capped::CappedCallback;
pub use markers::{MarkerStats, RetentionMarker, RetentionMarkers};
pub use record_store::{
    Damage, RecordStore, RecordStoreStats, TableMetadata, LOG_KEY_VERSION, MAX_FORMAT_VERSION,
    MIN_FORMAT_VERSION,
};
pub use size_storer::{SizeInfo, SizeStorer};
pub use validate::{AcceptAll, RecordValidator, ValidateLevel, ValidateResults};

pub(crate) use record_store::{size_key_for, StoreInner};
