//! Cursor Module
//!
//! Ordered and random traversal of a record store.
//!
//! ## Responsibilities
//! - Forward / backward iteration in id order within the store's key range
//! - Save / restore across unit-of-work boundaries
//! - End-of-data at the edge of the store's key prefix
//!
//! A cursor is bound to the recovery unit and snapshot generation it was
//! first used with. After the unit commits, aborts or abandons its snapshot
//! the cursor must be `save()`d and `restore()`d before it is used again.

use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use crate::error::{AtlasError, Result};
use crate::kv::Direction;
use crate::record::{Record, RecordId};
use crate::store::StoreInner;
use crate::txn::RecoveryUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// Never used; binds to the first unit it sees
    Unbound,
    Bound { unit: u64, generation: u64 },
    /// Released by `save()`; needs `restore()`
    Saved,
}

/// Ordered cursor over one record store
pub struct RecordCursor {
    store: Arc<StoreInner>,
    forward: bool,
    last_returned: Option<RecordId>,
    eof: bool,
    binding: Binding,
}

impl RecordCursor {
    pub(crate) fn new(store: Arc<StoreInner>, forward: bool) -> Self {
        Self {
            store,
            forward,
            last_returned: None,
            eof: false,
            binding: Binding::Unbound,
        }
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Id of the record most recently returned
    pub fn last_returned(&self) -> Option<RecordId> {
        self.last_returned
    }

    fn check_binding(&mut self, ru: &RecoveryUnit) -> Result<()> {
        match self.binding {
            Binding::Unbound => {
                self.binding = Binding::Bound {
                    unit: ru.id(),
                    generation: ru.generation(),
                };
                Ok(())
            }
            Binding::Bound { unit, generation }
                if unit == ru.id() && generation == ru.generation() =>
            {
                Ok(())
            }
            _ => Err(AtlasError::CursorNotRestored),
        }
    }

    /// Next record in cursor order, `None` at end of data
    pub fn next(&mut self, ru: &mut RecoveryUnit) -> Result<Option<Record>> {
        self.check_binding(ru)?;
        if self.eof {
            return Ok(None);
        }

        let format = self.store.key_format;
        let (lo, hi) = format.range();
        let last_key = self.last_returned.map(|id| format.encode(id));
        let (from, direction) = match (&last_key, self.forward) {
            (Some(key), true) => (Bound::Excluded(key.as_slice()), Direction::Forward),
            (Some(key), false) => (Bound::Excluded(key.as_slice()), Direction::Backward),
            (None, true) => (Bound::Included(lo.as_slice()), Direction::Forward),
            (None, false) => (Bound::Included(hi.as_slice()), Direction::Backward),
        };

        let entry = ru.session()?.scan_next(&self.store.table, from, direction)?;
        let Some(entry) = entry.filter(|e| format.owns(&e.key)) else {
            self.eof = true;
            return Ok(None);
        };

        let id = format.decode(&entry.key)?;
        if self.forward {
            if let Some(last) = self.last_returned {
                if id <= last {
                    debug!(ns = %self.store.ns, id = %id, last = %last, "cursor went backwards");
                    return Err(AtlasError::WriteConflict);
                }
            }
        }

        self.last_returned = Some(id);
        Ok(Some(Record::with_id(id, entry.value)))
    }

    /// Position on `id` exactly; `None` (and end of data) if it is absent
    pub fn seek_exact(&mut self, ru: &mut RecoveryUnit, id: RecordId) -> Result<Option<Record>> {
        self.check_binding(ru)?;
        let key = self.store.key_format.encode(id);
        match ru.session()?.get(&self.store.table, &key)? {
            Some(data) => {
                self.last_returned = Some(id);
                self.eof = false;
                Ok(Some(Record::with_id(id, data)))
            }
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    /// Release the cursor's snapshot binding, keeping its position
    pub fn save(&mut self) {
        self.binding = Binding::Saved;
    }

    /// Release the binding and forget the position
    pub fn save_unpositioned(&mut self) {
        self.save();
        self.last_returned = None;
        self.eof = false;
    }

    /// Rebind to `ru` and re-validate the saved position
    ///
    /// If the last returned record is gone from a capped or log store the
    /// cursor is exhausted and `CappedPositionLost` is returned; skipping it
    /// could hide a truncation. Ordinary stores resume at the nearest
    /// surviving record.
    pub fn restore(&mut self, ru: &mut RecoveryUnit) -> Result<()> {
        self.binding = Binding::Bound {
            unit: ru.id(),
            generation: ru.generation(),
        };
        if self.eof {
            return Ok(());
        }
        let Some(id) = self.last_returned else {
            return Ok(());
        };

        let key = self.store.key_format.encode(id);
        if ru.session()?.get(&self.store.table, &key)?.is_some() {
            return Ok(());
        }
        if self.store.capped {
            self.eof = true;
            debug!(ns = %self.store.ns, id = %id, "capped cursor position lost");
            return Err(AtlasError::CappedPositionLost(id));
        }
        Ok(())
    }
}

/// Cursor returning records sampled uniformly from the store
///
/// Records come back in no particular order, possibly repeated.
pub struct RandomCursor {
    store: Arc<StoreInner>,
}

impl RandomCursor {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self { store }
    }

    /// A random record, `None` if the store is empty
    pub fn next(&mut self, ru: &mut RecoveryUnit) -> Result<Option<Record>> {
        let format = self.store.key_format;
        let (lo, hi) = format.range();
        match ru.session()?.random_in(&self.store.table, &lo, &hi)? {
            Some(entry) => {
                let id = format.decode(&entry.key)?;
                Ok(Some(Record::with_id(id, entry.value)))
            }
            None => Ok(None),
        }
    }
}
