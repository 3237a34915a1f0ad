use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{CounterStore, MemoryCounterStore, Reservation, StoreError};

/// A memory store whose reservations can be made to fail, globally or for
/// selected keys.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryCounterStore,
    fail_all: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
    reservations: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.fail_all.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn fail_key(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_owned());
    }

    /// Successful reservations so far.
    pub(crate) fn reservations(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }

    pub(crate) fn inner(&self) -> &MemoryCounterStore {
        &self.inner
    }
}

impl CounterStore for FlakyStore {
    fn reserve(&self, key: &str, step: i64) -> Result<Reservation, StoreError> {
        if self.fail_all.load(Ordering::SeqCst) || self.failing_keys.lock().contains(key) {
            return Err(StoreError::Backend("store unreachable".into()));
        }
        let reservation = self.inner.reserve(key, step)?;
        self.reservations.fetch_add(1, Ordering::SeqCst);
        Ok(reservation)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.inner.create_schema()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

/// A memory store with a fixed parallelism that records the most
/// reservations it ever saw in flight at once.
pub(crate) struct BoundedStore {
    inner: MemoryCounterStore,
    parallelism: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl BoundedStore {
    pub(crate) fn new(parallelism: usize) -> Self {
        Self {
            inner: MemoryCounterStore::new(),
            parallelism,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl CounterStore for BoundedStore {
    fn reserve(&self, key: &str, step: i64) -> Result<Reservation, StoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // Long enough for overlapping workers to show up in `peak`.
        thread::sleep(Duration::from_millis(1));
        let result = self.inner.reserve(key, step);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.inner.create_schema()
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}
