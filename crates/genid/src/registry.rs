use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Mutex, RwLock};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{CounterStore, Error, KeyedGenerator, Result, SegmentEngine, validate_key};

type EngineMap<S> = HashMap<String, Arc<SegmentEngine<S>>>;

/// Owns the active key set and the [`SegmentEngine`] serving each key.
///
/// The key map is an immutable snapshot behind a read/write lock. Lookups
/// take the read lock just long enough to clone an engine handle, so they
/// run in parallel with each other and never wait on a refill. Replacing the
/// key set builds every new engine first and then swaps the snapshot under
/// the write lock, so readers only ever see a complete key set.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use genid::{MemoryCounterStore, Registry};
///
/// let registry = Registry::new(Arc::new(MemoryCounterStore::new()), 100).unwrap();
/// registry.enable_keys(["order", "user"]).unwrap();
///
/// assert_eq!(registry.next("order").unwrap(), 1);
/// assert_eq!(registry.next("order").unwrap(), 2);
/// assert_eq!(registry.current("order").unwrap(), 2);
/// assert!(registry.next("missing").unwrap_err().is_not_registered());
/// ```
pub struct Registry<S: CounterStore + ?Sized> {
    store: Arc<S>,
    step: i64,
    engines: RwLock<Arc<EngineMap<S>>>,
    closed: AtomicBool,
}

impl<S: CounterStore + ?Sized> Registry<S> {
    /// Creates an empty registry. Keys must be enabled before use.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStep`] if `step <= 0`.
    pub fn new(store: Arc<S>, step: i64) -> Result<Self> {
        if step <= 0 {
            return Err(Error::InvalidStep(step));
        }
        Ok(Self {
            store,
            step,
            engines: RwLock::new(Arc::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    /// Segment size used for every engine of this registry.
    pub const fn step(&self) -> i64 {
        self.step
    }

    /// Returns the enabled keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let snapshot = Arc::clone(&self.engines.read());
        let mut keys: Vec<String> = snapshot.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Returns the engine serving `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after [`Registry::close`].
    /// - [`Error::KeyNotRegistered`] if `key` is not enabled.
    pub fn engine(&self, key: &str) -> Result<Arc<SegmentEngine<S>>> {
        self.ensure_open()?;
        self.engines
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotRegistered(key.to_owned()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl<S: CounterStore + ?Sized + 'static> Registry<S> {
    /// Replaces the active key set with `keys`.
    ///
    /// Keys are validated, duplicates collapsed, and a fresh engine (with its
    /// first reservation) is built for every key concurrently, at most
    /// [`CounterStore::parallelism`] at a time. Only when all of them succeed
    /// is the active set swapped. Engines for keys that are
    /// not in the new set, and the previous engines of keys that are, are
    /// dropped along with their unspent identifiers.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after [`Registry::close`].
    /// - [`Error::InvalidKey`] for an empty or over-long key.
    /// - The first [`Error::Store`] raised while building an engine.
    ///
    /// On any error the previously active key set is left untouched.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
    pub fn enable_keys<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.ensure_open()?;

        let mut unique = BTreeSet::new();
        for key in keys {
            let key = key.as_ref();
            validate_key(key)?;
            unique.insert(key.to_owned());
        }

        let built = self.build_engines(unique)?;
        *self.engines.write() = Arc::new(built);

        #[cfg(feature = "tracing")]
        tracing::info!("enabled keys: {:?}", self.keys());
        Ok(())
    }

    /// Builds one engine per key on at most `store.parallelism()` worker
    /// threads. Workers stop taking keys once any build fails; all of them
    /// are joined before the result is returned.
    fn build_engines(&self, keys: BTreeSet<String>) -> Result<EngineMap<S>> {
        let step = self.step;
        let workers = self.store.parallelism().clamp(1, keys.len().max(1));
        let pending = &Mutex::new(keys.into_iter());
        let failed = &AtomicBool::new(false);
        let store = &self.store;

        let batches: Vec<Result<Vec<(String, SegmentEngine<S>)>>> = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(move || {
                        let mut built = Vec::new();
                        while !failed.load(Ordering::Acquire) {
                            let Some(key) = pending.lock().next() else {
                                break;
                            };
                            match SegmentEngine::new(&key, step, Arc::clone(store)) {
                                Ok(engine) => built.push((key, engine)),
                                Err(e) => {
                                    failed.store(true, Ordering::Release);
                                    return Err(e);
                                }
                            }
                        }
                        Ok(built)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut engines = HashMap::new();
        for batch in batches {
            for (key, engine) in batch? {
                engines.insert(key, Arc::new(engine));
            }
        }
        Ok(engines)
    }

    /// Issues the next identifier for `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::KeyNotRegistered`] if `key` is not enabled.
    /// - [`Error::Closed`] after [`Registry::close`].
    /// - [`Error::Store`] if a refill was needed and failed.
    pub fn next(&self, key: &str) -> Result<i64> {
        self.engine(key)?.next()
    }

    /// Returns the last identifier issued for `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::KeyNotRegistered`] if `key` is not enabled.
    /// - [`Error::Closed`] after [`Registry::close`].
    pub fn current(&self, key: &str) -> Result<i64> {
        Ok(self.engine(key)?.current())
    }

    /// Drops every engine and closes the store. The registry is unusable
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Propagates the store's close error. The registry is closed regardless.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        *self.engines.write() = Arc::new(HashMap::new());
        self.store.close()?;
        Ok(())
    }
}

impl<S: CounterStore + ?Sized + 'static> KeyedGenerator for Registry<S> {
    fn enable_keys(&self, keys: &[String]) -> Result<()> {
        Registry::enable_keys(self, keys)
    }

    fn next(&self, key: &str) -> Result<i64> {
        Registry::next(self, key)
    }

    fn current(&self, key: &str) -> Result<i64> {
        Registry::current(self, key)
    }

    fn close(&self) -> Result<()> {
        Registry::close(self)
    }
}

impl<S: CounterStore + ?Sized> core::fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry")
            .field("step", &self.step)
            .field("keys", &self.engines.read().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
