use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{CounterStore, Error, Result, StoreError};

/// A contiguous, exclusively owned range of reserved identifiers.
///
/// Identifiers in `(cur, max]` have been reserved in the store but not yet
/// issued. Every value up to and including `cur` since the last refill has
/// been handed to exactly one caller.
///
/// ## Invariants
///
/// - `cur <= max`
/// - `max - cur <= step`
/// - `max` equals the counter value last persisted for the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub cur: i64,
    pub max: i64,
    pub step: i64,
}

impl Segment {
    const fn from_reservation(previous_max: i64, new_max: i64, step: i64) -> Self {
        Self {
            cur: previous_max,
            max: new_max,
            step,
        }
    }

    /// Returns `true` once every reserved identifier has been issued.
    pub const fn is_exhausted(&self) -> bool {
        self.cur == self.max
    }

    /// Number of identifiers still available without a refill.
    pub const fn remaining(&self) -> i64 {
        self.max - self.cur
    }
}

/// Serves identifiers for a single key from an in-memory [`Segment`],
/// refilling from the [`CounterStore`] when the segment runs out.
///
/// Every operation runs under one mutex, so at most one refill per key is in
/// flight and callers of the same key wait while it runs. Engines for
/// different keys share nothing but the store.
///
/// An engine only exists in the ready state: construction performs the first
/// reservation, and a failed reservation yields no engine at all.
pub struct SegmentEngine<S: CounterStore + ?Sized> {
    key: String,
    store: Arc<S>,
    state: Mutex<Segment>,
}

impl<S: CounterStore + ?Sized> SegmentEngine<S> {
    /// Creates an engine for `key` and reserves its first segment.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidStep`] if `step <= 0`.
    /// - [`Error::Store`] if the initial reservation fails.
    ///
    /// # Example
    /// ```
    /// use std::sync::Arc;
    /// use genid::{MemoryCounterStore, SegmentEngine};
    ///
    /// let store = Arc::new(MemoryCounterStore::new());
    /// let engine = SegmentEngine::new("order", 100, store).unwrap();
    ///
    /// assert_eq!(engine.current(), 0);
    /// assert_eq!(engine.next().unwrap(), 1);
    /// assert_eq!(engine.current(), 1);
    /// ```
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(store)))]
    pub fn new(key: &str, step: i64, store: Arc<S>) -> Result<Self> {
        if step <= 0 {
            return Err(Error::InvalidStep(step));
        }
        #[cfg(feature = "tracing")]
        tracing::info!("initialize counter for key {key:?}");

        let reservation = store.reserve(key, step)?;
        Self::log_refill(key, reservation.previous_max, reservation.new_max);

        Ok(Self {
            key: key.to_owned(),
            store,
            state: Mutex::new(Segment::from_reservation(
                reservation.previous_max,
                reservation.new_max,
                step,
            )),
        })
    }

    /// The key whose counter row this engine reserves from.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Issues the next identifier, refilling the segment first if it is
    /// exhausted.
    ///
    /// A failed refill is returned as-is and leaves the segment unchanged, so
    /// the following call retries the refill.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] if a refill was needed and failed.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self), fields(key = %self.key)))]
    pub fn next(&self) -> Result<i64> {
        let mut segment = self.state.lock();
        if segment.is_exhausted() {
            *segment = self.refill(segment.step)?;
        }
        segment.cur += 1;
        Ok(segment.cur)
    }

    /// Returns the last issued identifier without allocating.
    ///
    /// Before anything is issued from a fresh segment this is the segment's
    /// lower watermark (the counter value before the last refill).
    pub fn current(&self) -> i64 {
        self.state.lock().cur
    }

    /// Returns a copy of the current segment.
    pub fn segment(&self) -> Segment {
        *self.state.lock()
    }

    fn refill(&self, step: i64) -> Result<Segment, StoreError> {
        #[cfg(feature = "tracing")]
        tracing::info!("increase counter for key {:?}", self.key);

        let reservation = self.store.reserve(&self.key, step)?;
        Self::log_refill(&self.key, reservation.previous_max, reservation.new_max);
        Ok(Segment::from_reservation(
            reservation.previous_max,
            reservation.new_max,
            step,
        ))
    }

    #[inline]
    fn log_refill(_key: &str, _from: i64, _to: i64) {
        #[cfg(feature = "tracing")]
        tracing::info!("counter for key {_key:?} is increased from {_from} to {_to}");
    }
}

impl<S: CounterStore + ?Sized> core::fmt::Debug for SegmentEngine<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentEngine")
            .field("key", &self.key)
            .field("segment", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
