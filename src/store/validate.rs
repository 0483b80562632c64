//! Record store validation
//!
//! Structural verification through the engine plus a full record scan.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cursor::RecordCursor;
use crate::error::Result;
use crate::kv::VerifyStatus;
use crate::record::RecordId;
use crate::txn::RecoveryUnit;

use super::StoreInner;

/// How thorough `validate()` is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateLevel {
    /// Scan records only
    Quick,
    /// Also run the engine's structural verification
    Full,
}

/// Checks one record's payload
pub trait RecordValidator {
    fn validate(&self, id: RecordId, data: &[u8]) -> std::result::Result<(), String>;
}

/// Validator that accepts every payload
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _id: RecordId, _data: &[u8]) -> std::result::Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidateResults {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub nrecords: i64,
    pub data_size: i64,
    pub n_invalid: i64,
}

pub(crate) fn validate_store(
    store: &Arc<StoreInner>,
    ru: &mut RecoveryUnit,
    level: ValidateLevel,
    validator: &dyn RecordValidator,
) -> Result<ValidateResults> {
    let mut results = ValidateResults {
        valid: true,
        ..Default::default()
    };

    if level == ValidateLevel::Full {
        match store.kv.verify(&store.table)? {
            VerifyStatus::Clean => {}
            VerifyStatus::Busy => {
                let msg = format!(
                    "verify of {} skipped because the table is in use; not treating as invalid",
                    store.table
                );
                warn!(ns = %store.ns, "{}", msg);
                results.warnings.push(msg);
            }
            VerifyStatus::Damaged(reason) => {
                results.errors.push(format!(
                    "verify of {} failed: {}; records were not scanned",
                    store.table, reason
                ));
                results.valid = false;
                return Ok(results);
            }
        }
    }

    let mut cursor = RecordCursor::new(Arc::clone(store), true);
    while let Some(record) = cursor.next(ru)? {
        results.nrecords += 1;
        results.data_size += record.len() as i64;
        if let Err(reason) = validator.validate(record.id, &record.data) {
            results.n_invalid += 1;
            if results.errors.len() < 100 {
                results.errors.push(format!("record {} is invalid: {}", record.id, reason));
            }
        }
    }

    if results.n_invalid > 0 {
        results.valid = false;
        results.errors.push(format!(
            "{} invalid records found in {}",
            results.n_invalid, store.ns
        ));
    }

    if results.valid {
        store.update_stats_after_repair(results.nrecords, results.data_size);
    }

    info!(
        ns = %store.ns,
        valid = results.valid,
        nrecords = results.nrecords,
        n_invalid = results.n_invalid,
        "validated record store"
    );
    Ok(results)
}
