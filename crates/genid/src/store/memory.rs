use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{CounterRow, CounterStore, Reservation, StoreError, check_step, now_secs};

/// A process-local counter store.
///
/// Rows live in a mutex-guarded map, so reservations are totally ordered just
/// like the SQL backends, but nothing survives the process. Restarting with a
/// fresh memory store restarts every sequence at `1`; use it for tests and
/// throwaway deployments only.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    rows: Mutex<HashMap<String, CounterRow>>,
    closed: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the persisted row for `key`, if any.
    pub fn row(&self, key: &str) -> Option<CounterRow> {
        self.rows.lock().get(key).cloned()
    }

    /// Number of keys that have ever been reserved.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CounterStore for MemoryCounterStore {
    fn reserve(&self, key: &str, step: i64) -> Result<Reservation, StoreError> {
        check_step(step)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let now = now_secs() as u64;
        let mut rows = self.rows.lock();
        match rows.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(CounterRow {
                    key: key.to_owned(),
                    value: step as u64,
                    last_mod_at: now,
                });
                Ok(Reservation::first(step))
            }
            Entry::Occupied(mut slot) => {
                let row = slot.get_mut();
                let previous = i64::try_from(row.value).map_err(|_| StoreError::Overflow {
                    key: key.to_owned(),
                })?;
                let reservation = Reservation::extend(key, previous, step)?;
                row.value = reservation.new_max as u64;
                row.last_mod_at = now;
                Ok(reservation)
            }
        }
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
