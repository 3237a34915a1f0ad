//! Persistent counter stores.
//!
//! A counter store owns one table keyed by identifier name. Each row records
//! the highest identifier ever *reserved* for that name. The only mutation is
//! [`CounterStore::reserve`], which reads the row under an exclusive lock and
//! then inserts or advances it inside one transaction. That lock is the sole
//! point of coordination between processes sharing a store: it totally orders
//! reservations for a key, so two engines never receive overlapping segments.
//!
//! ## Backends
//!
//! - [`MemoryCounterStore`]: process-local, not durable. For tests and
//!   throwaway runs.
//! - [`SqliteCounterStore`]: `BEGIN IMMEDIATE` transactions against a database
//!   file (feature `sqlite`, on by default).
//! - [`PgCounterStore`]: `SELECT ... FOR UPDATE` against PostgreSQL (feature
//!   `postgres`).

mod memory;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod pool;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryCounterStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgConfig, PgCounterStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConfig, SqliteCounterStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Default name of the counter table.
pub const DEFAULT_TABLE: &str = "genid_counter";

/// Reservations a store runs at once unless it reports its own limit.
pub const DEFAULT_PARALLELISM: usize = 8;

/// Longest table name accepted by the SQL backends.
const MAX_TABLE_NAME_LEN: usize = 64;

/// Errors raised while reserving a segment.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested segment size is not positive. Rejected before any I/O.
    #[error("invalid step: {0}")]
    InvalidStep(i64),

    /// The configured table name is not a plain SQL identifier.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// Another reserver created the row for `key` first. The caller may retry,
    /// which will take the update path.
    #[error("counter row for key {key:?} was created concurrently")]
    Conflict { key: String },

    /// Advancing the counter would exceed `i64::MAX`.
    #[error("counter for key {key:?} overflowed")]
    Overflow { key: String },

    /// The stored counter holds a value no reservation could have written.
    #[error("counter for key {key:?} holds invalid value {value}")]
    Corrupt { key: String, value: i64 },

    /// An insert or update touched a number of rows other than one.
    #[error("invalid affected row count: expected {expected}, got {actual}")]
    UnexpectedRowCount { expected: u64, actual: u64 },

    /// The store was closed.
    #[error("counter store is closed")]
    Closed,

    /// A failure reported by a backend outside this crate. Custom
    /// [`CounterStore`] implementations use it for errors that have no
    /// dedicated variant.
    #[error("{0}")]
    Backend(String),

    /// No pooled connection became available within the connect timeout, or
    /// a new one could not be opened.
    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[cfg(feature = "sqlite")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("postgres: {0}")]
    Postgres(#[from] ::postgres::Error),
}

/// The outcome of one reservation: the identifiers in
/// `(previous_max, new_max]` now belong exclusively to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reservation {
    /// The counter value before this reservation (`0` for a new key).
    pub previous_max: i64,
    /// The counter value persisted by this reservation.
    pub new_max: i64,
}

impl Reservation {
    /// The reservation that creates the row for a previously unseen key.
    pub(crate) const fn first(step: i64) -> Self {
        Self {
            previous_max: 0,
            new_max: step,
        }
    }

    /// Advances an existing counter by `step`.
    pub(crate) fn extend(key: &str, previous: i64, step: i64) -> Result<Self, StoreError> {
        if previous < 0 {
            return Err(StoreError::Corrupt {
                key: key.to_owned(),
                value: previous,
            });
        }
        let new_max = previous
            .checked_add(step)
            .ok_or_else(|| StoreError::Overflow {
                key: key.to_owned(),
            })?;
        Ok(Self {
            previous_max: previous,
            new_max,
        })
    }

    /// Number of identifiers handed out by this reservation.
    pub const fn len(&self) -> i64 {
        self.new_max - self.previous_max
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A counter row as persisted by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRow {
    pub key: String,
    /// Highest identifier ever reserved for `key`. Never decreases.
    pub value: u64,
    /// Epoch seconds of the last reservation.
    pub last_mod_at: u64,
}

/// Atomic "reserve the next `step` identifiers for `key`" primitive.
///
/// Implementations must be safe under arbitrary concurrent callers, including
/// callers in other processes sharing the same backing store. Reservations
/// for one key are totally ordered; reservations for different keys must not
/// block each other beyond what the backend itself imposes.
pub trait CounterStore: Send + Sync {
    /// Reserves the next `step` identifiers for `key`, creating the counter
    /// row on first use.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidStep`] if `step <= 0`, before any I/O.
    /// - [`StoreError::Conflict`] if a concurrent reserver created the row
    ///   first.
    /// - Any backend, row-count or overflow failure. The transaction is rolled
    ///   back and nothing is persisted.
    fn reserve(&self, key: &str, step: i64) -> Result<Reservation, StoreError>;

    /// Creates the counter table if it does not exist yet.
    ///
    /// This is a one-time administrative step, not part of request handling.
    fn create_schema(&self) -> Result<(), StoreError>;

    /// How many reservations this store can usefully run at the same time.
    ///
    /// [`Registry::enable_keys`](crate::Registry::enable_keys) never builds
    /// more engines concurrently than this. Pooled stores report their
    /// connection limit.
    fn parallelism(&self) -> usize {
        DEFAULT_PARALLELISM
    }

    /// Releases pooled connections. Later reservations fail with
    /// [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

pub(crate) fn check_step(step: i64) -> Result<(), StoreError> {
    if step <= 0 {
        return Err(StoreError::InvalidStep(step));
    }
    Ok(())
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, up to 64 bytes.
pub(crate) fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_head || !valid_tail || table.len() > MAX_TABLE_NAME_LEN {
        return Err(StoreError::InvalidTableName(table.to_owned()));
    }
    Ok(())
}

pub(crate) fn expect_one_row(affected: u64) -> Result<(), StoreError> {
    if affected != 1 {
        return Err(StoreError::UnexpectedRowCount {
            expected: 1,
            actual: affected,
        });
    }
    Ok(())
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// SQL text for one counter table, with backend-specific placeholders.
#[cfg(any(feature = "sqlite", feature = "postgres"))]
#[derive(Debug, Clone)]
pub(crate) struct Statements {
    pub(crate) select: String,
    pub(crate) insert: String,
    pub(crate) update: String,
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl Statements {
    /// `placeholder(n)` renders the n-th (1-based) bind parameter and
    /// `lock_suffix` is appended to the select (e.g. `FOR UPDATE`).
    pub(crate) fn new(table: &str, placeholder: fn(usize) -> String, lock_suffix: &str) -> Self {
        let p = placeholder;
        Self {
            select: format!(
                "SELECT \"value\" FROM {table} WHERE \"key\" = {}{lock_suffix}",
                p(1)
            ),
            insert: format!(
                "INSERT INTO {table} (\"key\", \"value\", \"last_mod_at\") VALUES ({}, {}, {})",
                p(1),
                p(2),
                p(3)
            ),
            update: format!(
                "UPDATE {table} SET \"value\" = {}, \"last_mod_at\" = {} WHERE \"key\" = {}",
                p(1),
                p(2),
                p(3)
            ),
        }
    }
}
