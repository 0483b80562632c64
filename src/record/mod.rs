//! Record Module
//!
//! Record identifiers, records, and the on-disk key formats.
//!
//! ## Record Ids
//! - `0` is the null id, never assigned to a record
//! - Ordinary collections assign ids from a counter starting at 1
//! - Log collections take the id from the timestamp embedded at the start
//!   of every log payload (`secs << 32 | inc`, 8 bytes big-endian)

mod key;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

pub use key::{KeyFormat, PREFIXED_KEY_LEN, STANDARD_KEY_LEN};

/// Ordered identifier of a record within one store
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RecordId(i64);

impl RecordId {
    /// The null id (no record)
    pub const NULL: RecordId = RecordId(0);

    /// Smallest representable id, sorts before every record
    pub const MIN: RecordId = RecordId(i64::MIN);

    /// Largest representable id, sorts after every record
    pub const MAX: RecordId = RecordId(i64::MAX);

    pub const fn new(repr: i64) -> Self {
        Self(repr)
    }

    #[inline]
    pub fn repr(&self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Ids that may be assigned to a record
    #[inline]
    pub fn is_normal(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(repr: i64) -> Self {
        Self(repr)
    }
}

/// A stored record: id plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub data: Bytes,
}

impl Record {
    /// A record that has not been assigned an id yet
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            id: RecordId::NULL,
            data: data.into(),
        }
    }

    pub fn with_id(id: RecordId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// =============================================================================
// Log Timestamps
// =============================================================================

/// Size of the timestamp header carried by every log payload
pub const LOG_TIMESTAMP_LEN: usize = 8;

/// Timestamp of a log entry; also the entry's record id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogTimestamp {
    pub secs: u32,
    pub inc: u32,
}

impl LogTimestamp {
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            secs: (value >> 32) as u32,
            inc: value as u32,
        }
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        ((self.secs as u64) << 32) | self.inc as u64
    }

    pub fn is_null(&self) -> bool {
        self.as_u64() == 0
    }

    /// The record id this timestamp maps to
    pub fn record_id(&self) -> RecordId {
        RecordId(self.as_u64() as i64)
    }

    /// Build a log payload: timestamp header followed by `body`
    pub fn encode_entry(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOG_TIMESTAMP_LEN + body.len());
        out.extend_from_slice(&self.as_u64().to_be_bytes());
        out.extend_from_slice(body);
        out
    }
}

impl fmt::Display for LogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Extract the record id from a log payload
pub fn extract_log_key(data: &[u8]) -> Result<RecordId> {
    if data.len() < LOG_TIMESTAMP_LEN {
        return Err(AtlasError::BadValue(format!(
            "log entry of {} bytes has no timestamp",
            data.len()
        )));
    }

    let mut raw = [0u8; LOG_TIMESTAMP_LEN];
    raw.copy_from_slice(&data[..LOG_TIMESTAMP_LEN]);
    let ts = LogTimestamp::from_u64(u64::from_be_bytes(raw));

    let id = ts.record_id();
    if !id.is_normal() {
        return Err(AtlasError::BadValue(format!(
            "log entry timestamp {} is not a valid record id",
            ts
        )));
    }
    Ok(id)
}
