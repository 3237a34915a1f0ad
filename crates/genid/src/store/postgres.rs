use std::time::Duration;

use ::postgres::error::SqlState;
use ::postgres::{Client, NoTls};

#[cfg(feature = "tracing")]
use tracing::instrument;

use super::pool::{ConnectionPool, DEFAULT_CONNECT_TIMEOUT};
use super::{
    CounterStore, DEFAULT_TABLE, Reservation, Statements, StoreError, check_step, expect_one_row,
    now_secs, validate_table_name,
};

const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Configuration for [`PgCounterStore`].
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// libpq-style connection string or `postgres://` URL.
    pub dsn: String,
    /// Name of the counter table.
    pub table: String,
    /// Upper bound on open connections. Keep it well under the server's
    /// `max_connections`, summed over every process sharing the database.
    pub max_connections: u32,
    /// How long a reservation waits for a free connection.
    pub connect_timeout: Duration,
}

impl PgConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            table: DEFAULT_TABLE.to_owned(),
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

/// A counter store backed by a PostgreSQL table.
///
/// Reservations read the counter with `SELECT ... FOR UPDATE`, which holds the
/// row lock until commit. Concurrent reservers of the same key queue on that
/// lock; other keys are unaffected. A key with no row yet has nothing to lock,
/// so two first reservations may both try to insert; the loser fails with
/// [`StoreError::Conflict`] and is expected to retry.
pub struct PgCounterStore {
    config: PgConfig,
    statements: Statements,
    pool: ConnectionPool<PgManager>,
}

impl PgCounterStore {
    /// Connects once to validate the DSN and keeps that connection pooled.
    pub fn connect(config: PgConfig) -> Result<Self, StoreError> {
        validate_table_name(&config.table)?;
        let statements = statements(&config.table);
        let manager = PgManager {
            dsn: config.dsn.clone(),
        };
        let pool = ConnectionPool::new(manager, config.max_connections, config.connect_timeout)?;
        Ok(Self {
            config,
            statements,
            pool,
        })
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

impl CounterStore for PgCounterStore {
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    fn reserve(&self, key: &str, step: i64) -> Result<Reservation, StoreError> {
        check_step(step)?;
        let mut conn = self.pool.get()?;
        reserve_in(&mut conn, &self.statements, key, step)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        conn.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                \"id\" BIGSERIAL PRIMARY KEY,
                \"key\" VARCHAR(32) NOT NULL UNIQUE,
                \"value\" BIGINT NOT NULL CHECK (\"value\" >= 0),
                \"last_mod_at\" BIGINT NOT NULL CHECK (\"last_mod_at\" >= 0)
            )",
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

/// Runs one reservation inside a transaction holding the row lock.
///
/// Dropping the transaction on an early return rolls it back.
fn reserve_in(
    client: &mut Client,
    sql: &Statements,
    key: &str,
    step: i64,
) -> Result<Reservation, StoreError> {
    let mut tx = client.transaction()?;
    let now = now_secs();

    let current: Option<i64> = tx
        .query_opt(sql.select.as_str(), &[&key])?
        .map(|row| row.try_get(0))
        .transpose()?;

    let reservation = match current {
        None => {
            let affected = match tx.execute(sql.insert.as_str(), &[&key, &step, &now]) {
                Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                    return Err(StoreError::Conflict {
                        key: key.to_owned(),
                    });
                }
                other => other?,
            };
            expect_one_row(affected)?;
            Reservation::first(step)
        }
        Some(previous) => {
            let reservation = Reservation::extend(key, previous, step)?;
            let affected = tx.execute(sql.update.as_str(), &[&reservation.new_max, &now, &key])?;
            expect_one_row(affected)?;
            reservation
        }
    };

    tx.commit()?;
    Ok(reservation)
}

fn statements(table: &str) -> Statements {
    Statements::new(table, |n| format!("${n}"), " FOR UPDATE")
}

/// Opens clients for the pool. A client whose server session has ended is
/// replaced on checkout and dropped on return.
#[derive(Debug)]
struct PgManager {
    dsn: String,
}

impl r2d2::ManageConnection for PgManager {
    type Connection = Client;
    type Error = ::postgres::Error;

    fn connect(&self) -> Result<Client, ::postgres::Error> {
        Client::connect(&self.dsn, NoTls)
    }

    fn is_valid(&self, conn: &mut Client) -> Result<(), ::postgres::Error> {
        conn.simple_query("").map(|_| ())
    }

    fn has_broken(&self, conn: &mut Client) -> bool {
        conn.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_use_dollar_placeholders_and_lock_the_row() {
        let sql = statements("genid_counter");
        assert_eq!(
            sql.select,
            "SELECT \"value\" FROM genid_counter WHERE \"key\" = $1 FOR UPDATE"
        );
        assert_eq!(
            sql.insert,
            "INSERT INTO genid_counter (\"key\", \"value\", \"last_mod_at\") VALUES ($1, $2, $3)"
        );
        assert_eq!(
            sql.update,
            "UPDATE genid_counter SET \"value\" = $1, \"last_mod_at\" = $2 WHERE \"key\" = $3"
        );
    }

    #[test]
    fn config_defaults_and_builders() {
        let config = PgConfig::new("host=localhost user=genid");
        assert_eq!(config.table, DEFAULT_TABLE);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        let config = config
            .with_table("ids")
            .with_max_connections(2)
            .with_connect_timeout(Duration::from_secs(1));
        assert_eq!(config.table, "ids");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn rejects_bad_table_name_before_connecting() {
        let config = PgConfig::new("host=localhost").with_table("x; DROP");
        assert!(matches!(
            PgCounterStore::connect(config),
            Err(StoreError::InvalidTableName(_))
        ));
    }
}
