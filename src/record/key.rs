//! Record key encoding
//!
//! Keys are fixed-width and order-preserving under byte comparison:
//!
//! ```text
//! Standard:  [id: i64 (sign-flipped, BE)]                      8 bytes
//! Prefixed:  [prefix: i64 (sign-flipped, BE)][id: i64 (...)]  16 bytes
//! ```
//!
//! Flipping the sign bit makes negative values sort before positive ones,
//! so `RecordId::MIN..=RecordId::MAX` maps onto the full byte range.

use crate::error::{AtlasError, Result};

use super::RecordId;

pub const STANDARD_KEY_LEN: usize = 8;
pub const PREFIXED_KEY_LEN: usize = 16;

const SIGN_BIT: u64 = 1 << 63;

/// How record ids map to engine keys for one record store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// One collection per table
    Standard,
    /// Several collections per table, disambiguated by prefix
    Prefixed(i64),
}

impl KeyFormat {
    pub fn for_prefix(prefix: Option<i64>) -> Self {
        match prefix {
            Some(p) => KeyFormat::Prefixed(p),
            None => KeyFormat::Standard,
        }
    }

    pub fn is_prefixed(&self) -> bool {
        matches!(self, KeyFormat::Prefixed(_))
    }

    /// Encode `id` into an engine key
    pub fn encode(&self, id: RecordId) -> Vec<u8> {
        match self {
            KeyFormat::Standard => encode_i64(id.repr()).to_vec(),
            KeyFormat::Prefixed(prefix) => {
                let mut key = Vec::with_capacity(PREFIXED_KEY_LEN);
                key.extend_from_slice(&encode_i64(*prefix));
                key.extend_from_slice(&encode_i64(id.repr()));
                key
            }
        }
    }

    /// Decode an engine key produced by [`encode`](Self::encode)
    pub fn decode(&self, key: &[u8]) -> Result<RecordId> {
        match self {
            KeyFormat::Standard => {
                if key.len() != STANDARD_KEY_LEN {
                    return Err(AtlasError::Corruption(format!(
                        "expected {} byte key, got {}",
                        STANDARD_KEY_LEN,
                        key.len()
                    )));
                }
                Ok(RecordId::new(decode_i64(key)))
            }
            KeyFormat::Prefixed(prefix) => {
                if key.len() != PREFIXED_KEY_LEN {
                    return Err(AtlasError::Corruption(format!(
                        "expected {} byte key, got {}",
                        PREFIXED_KEY_LEN,
                        key.len()
                    )));
                }
                let found = decode_i64(&key[..8]);
                if found != *prefix {
                    return Err(AtlasError::Corruption(format!(
                        "key prefix {} does not match store prefix {}",
                        found, prefix
                    )));
                }
                Ok(RecordId::new(decode_i64(&key[8..])))
            }
        }
    }

    /// Whether `key` belongs to this store's key range
    pub fn owns(&self, key: &[u8]) -> bool {
        match self {
            KeyFormat::Standard => key.len() == STANDARD_KEY_LEN,
            KeyFormat::Prefixed(prefix) => {
                key.len() == PREFIXED_KEY_LEN && decode_i64(&key[..8]) == *prefix
            }
        }
    }

    /// Inclusive bounds of every key this store can own
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        (self.encode(RecordId::MIN), self.encode(RecordId::MAX))
    }
}

#[inline]
fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ SIGN_BIT).to_be_bytes()
}

#[inline]
fn decode_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    (u64::from_be_bytes(raw) ^ SIGN_BIT) as i64
}
