use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior, params};

#[cfg(feature = "tracing")]
use tracing::instrument;

use super::pool::{ConnectionPool, DEFAULT_CONNECT_TIMEOUT};
use super::{
    CounterStore, DEFAULT_TABLE, Reservation, Statements, StoreError, check_step, expect_one_row,
    now_secs, validate_table_name,
};

/// Default time a reservation waits for another writer's lock, in ms.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default number of connections open at once.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Configuration for [`SqliteCounterStore`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file. Every process sharing counters must point
    /// at the same file.
    pub path: PathBuf,
    /// Name of the counter table.
    pub table: String,
    /// How long a reservation waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// Upper bound on open connections, and so on reservations in flight.
    pub max_connections: u32,
    /// How long a reservation waits for a free connection.
    pub connect_timeout: Duration,
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: DEFAULT_TABLE.to_owned(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    #[must_use]
    pub const fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// A counter store backed by an SQLite database file.
///
/// SQLite has no row locks, so each reservation runs in a `BEGIN IMMEDIATE`
/// transaction: the database write lock is taken before the counter is read
/// and held until commit. Reservations are therefore serialized across every
/// connection and every process using the file, which gives the same
/// read-lock-then-write guarantee as `SELECT ... FOR UPDATE`. Because the
/// lock is taken before the existence check, two first reservations for the
/// same key cannot race on the insert.
pub struct SqliteCounterStore {
    config: SqliteConfig,
    statements: Statements,
    pool: ConnectionPool<SqliteManager>,
}

impl SqliteCounterStore {
    /// Opens the database and verifies it can be reached.
    ///
    /// The counter table is not created here; run
    /// [`CounterStore::create_schema`] once beforehand.
    pub fn open(config: SqliteConfig) -> Result<Self, StoreError> {
        validate_table_name(&config.table)?;
        let statements = statements(&config.table);
        let manager = SqliteManager {
            path: config.path.clone(),
            busy_timeout: config.busy_timeout,
        };
        let pool = ConnectionPool::new(manager, config.max_connections, config.connect_timeout)?;
        Ok(Self {
            config,
            statements,
            pool,
        })
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }
}

impl CounterStore for SqliteCounterStore {
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    fn reserve(&self, key: &str, step: i64) -> Result<Reservation, StoreError> {
        check_step(step)?;
        let mut conn = self.pool.get()?;
        reserve_in(&mut conn, &self.statements, key, step)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,
                \"key\" VARCHAR(32) NOT NULL UNIQUE,
                \"value\" INTEGER NOT NULL CHECK (\"value\" >= 0),
                \"last_mod_at\" INTEGER NOT NULL CHECK (\"last_mod_at\" >= 0)
            );",
            self.config.table
        ))?;
        Ok(())
    }

    fn parallelism(&self) -> usize {
        self.pool.max_size() as usize
    }

    fn close(&self) -> Result<(), StoreError> {
        self.pool.close();
        Ok(())
    }
}

/// Runs one reservation inside a write-locked transaction on `conn`.
///
/// Any early return drops the transaction, which rolls it back.
fn reserve_in(
    conn: &mut Connection,
    sql: &Statements,
    key: &str,
    step: i64,
) -> Result<Reservation, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_secs();

    let current: Option<i64> = tx
        .prepare_cached(&sql.select)?
        .query_row(params![key], |row| row.get(0))
        .optional()?;

    let reservation = match current {
        None => {
            let inserted = tx
                .prepare_cached(&sql.insert)?
                .execute(params![key, step, now]);
            let affected = match inserted {
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::Conflict {
                        key: key.to_owned(),
                    });
                }
                other => other?,
            };
            expect_one_row(affected as u64)?;
            Reservation::first(step)
        }
        Some(previous) => {
            let reservation = Reservation::extend(key, previous, step)?;
            let affected = tx
                .prepare_cached(&sql.update)?
                .execute(params![reservation.new_max, now, key])?;
            expect_one_row(affected as u64)?;
            reservation
        }
    };

    tx.commit()?;
    Ok(reservation)
}

fn statements(table: &str) -> Statements {
    Statements::new(table, |n| format!("?{n}"), "")
}

/// Opens connections for the pool. A connection left inside a transaction
/// (e.g. by a panic mid-reservation) is dropped instead of reused.
#[derive(Debug)]
struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl r2d2::ManageConnection for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        open_connection(&self.path, self.busy_timeout)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("")
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        !conn.is_autocommit()
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, rusqlite::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> SqliteCounterStore {
        let store =
            SqliteCounterStore::open(SqliteConfig::new(dir.path().join("genid.db"))).unwrap();
        store.create_schema().unwrap();
        store
    }

    fn stored_value(store: &SqliteCounterStore, key: &str) -> Option<i64> {
        let conn = store.pool.get().unwrap();
        conn.query_row(
            "SELECT \"value\" FROM genid_counter WHERE \"key\" = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .unwrap()
    }

    #[test]
    fn first_reservation_inserts_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let r = store.reserve("order", 100).unwrap();
        assert_eq!(r, Reservation { previous_max: 0, new_max: 100 });
        assert_eq!(stored_value(&store, "order"), Some(100));
    }

    #[test]
    fn later_reservations_update_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.reserve("order", 100).unwrap();
        let r = store.reserve("order", 100).unwrap();
        assert_eq!(r, Reservation { previous_max: 100, new_max: 200 });
        assert_eq!(stored_value(&store, "order"), Some(200));
    }

    #[test]
    fn create_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.reserve("k", 3).unwrap();
        store.create_schema().unwrap();
        assert_eq!(stored_value(&store, "k"), Some(3));
    }

    #[test]
    fn missing_table_fails_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteCounterStore::open(SqliteConfig::new(dir.path().join("genid.db"))).unwrap();
        assert!(matches!(store.reserve("k", 3), Err(StoreError::Sqlite(_))));

        store.create_schema().unwrap();
        let r = store.reserve("k", 3).unwrap();
        assert_eq!(r.previous_max, 0);
    }

    #[test]
    fn rejects_bad_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig::new(dir.path().join("genid.db")).with_table("x; DROP");
        assert!(matches!(
            SqliteCounterStore::open(config),
            Err(StoreError::InvalidTableName(_))
        ));
    }

    #[test]
    fn custom_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig::new(dir.path().join("genid.db")).with_table("ids");
        let store = SqliteCounterStore::open(config).unwrap();
        store.create_schema().unwrap();
        assert_eq!(store.reserve("k", 2).unwrap().new_max, 2);
        assert_eq!(store.reserve("k", 2).unwrap().new_max, 4);
    }

    #[test]
    fn statements_use_numbered_placeholders_without_row_locks() {
        let sql = statements("genid_counter");
        assert_eq!(
            sql.select,
            "SELECT \"value\" FROM genid_counter WHERE \"key\" = ?1"
        );
        assert_eq!(
            sql.insert,
            "INSERT INTO genid_counter (\"key\", \"value\", \"last_mod_at\") VALUES (?1, ?2, ?3)"
        );
        assert_eq!(
            sql.update,
            "UPDATE genid_counter SET \"value\" = ?1, \"last_mod_at\" = ?2 WHERE \"key\" = ?3"
        );
    }

    #[test]
    fn parallelism_follows_max_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig::new(dir.path().join("genid.db")).with_max_connections(3);
        let store = SqliteCounterStore::open(config).unwrap();
        assert_eq!(store.parallelism(), 3);
    }

    #[test]
    fn unopenable_path_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig::new(dir.path().join("missing").join("genid.db"))
            .with_connect_timeout(Duration::from_millis(100));
        assert!(matches!(
            SqliteCounterStore::open(config),
            Err(StoreError::Pool(_))
        ));
    }

    #[test]
    fn closed_store_refuses_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.close().unwrap();
        assert!(matches!(store.reserve("k", 1), Err(StoreError::Closed)));
    }
}
