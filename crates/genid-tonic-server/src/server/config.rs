use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use genid::store::{DEFAULT_TABLE, SqliteConfig};
use genid::validate_key;

/// Runtime configuration for the `genid-server` binary.
///
/// Every option can be given on the command line or through the environment
/// (including a `.env` file in the working directory).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "genid-server",
    version,
    about = "A gRPC service issuing per-key monotonic IDs"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Mode>,

    /// Storage engine holding the counter table.
    ///
    /// Environment variable: `GENID_ENGINE`
    #[arg(long, env = "GENID_ENGINE", value_enum, default_value_t = Engine::Sqlite)]
    pub engine: Engine,

    /// SQLite database path or PostgreSQL connection string.
    ///
    /// Environment variable: `GENID_DSN`
    #[arg(long, env = "GENID_DSN", default_value_t = String::from("genid.db"))]
    pub dsn: String,

    /// Name of the counter table.
    ///
    /// Environment variable: `GENID_TABLE`
    #[arg(long, env = "GENID_TABLE", default_value_t = String::from(DEFAULT_TABLE))]
    pub table: String,

    /// How long a SQLite connection waits on a locked database, in
    /// milliseconds.
    ///
    /// Environment variable: `GENID_BUSY_TIMEOUT_MS`
    #[arg(long, env = "GENID_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout_ms: u64,

    /// Maximum database connections held by the store. Also bounds how many
    /// keys are initialized at once. Defaults to 4 for SQLite and 8 for
    /// PostgreSQL.
    ///
    /// Environment variable: `GENID_MAX_CONNECTIONS`
    #[arg(long, env = "GENID_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Number of identifiers reserved per store round trip.
    ///
    /// Larger steps mean fewer writes but more identifiers forfeited on
    /// restart.
    ///
    /// Environment variable: `GENID_STEP`
    #[arg(long, env = "GENID_STEP", default_value_t = 1000)]
    pub step: i64,

    /// Comma-separated keys to serve, e.g. `order,user`.
    ///
    /// Environment variable: `GENID_KEYS`
    #[arg(long, env = "GENID_KEYS", value_delimiter = ',')]
    pub keys: Vec<String>,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/genid.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Deadline for a single request, in milliseconds. `0` disables it.
    ///
    /// Environment variable: `GENID_RW_TIMEOUT_MS`
    #[arg(long, env = "GENID_RW_TIMEOUT_MS", default_value_t = 0)]
    pub rw_timeout_ms: u64,

    /// Interval of HTTP/2 keepalive pings on idle connections, in
    /// milliseconds. A peer that does not answer a ping is disconnected.
    /// `0` disables keepalives.
    ///
    /// Environment variable: `GENID_IDLE_TIMEOUT_MS`
    #[arg(long, env = "GENID_IDLE_TIMEOUT_MS", default_value_t = 0)]
    pub idle_timeout_ms: u64,

    /// Write the process ID here while serving.
    ///
    /// Environment variable: `GENID_PID_FILE`
    #[arg(long, env = "GENID_PID_FILE")]
    pub pid_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Create the counter table if it does not exist, then exit.
    Init,
    /// Serve requests (the default).
    #[default]
    Run,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Sqlite,
    Postgres,
    /// Process-local counters; identifiers restart on every launch.
    Memory,
}

/// Where counters are persisted.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory,
    Sqlite(SqliteConfig),
    #[cfg(feature = "postgres")]
    Postgres(genid::store::PgConfig),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: Mode,
    pub store: StoreConfig,
    pub step: i64,
    pub keys: Vec<String>,
    pub server_addr: String,
    pub uds: bool,
    pub pid_file: Option<PathBuf>,
    /// Per-request deadline; `None` waits indefinitely.
    pub rw_timeout: Option<Duration>,
    /// Keepalive interval for idle connections; `None` disables probes.
    pub idle_timeout: Option<Duration>,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.step <= 0 {
            bail!("GENID_STEP must be greater than 0 (got {})", args.step);
        }

        let keys: Vec<String> = args
            .keys
            .iter()
            .map(|key| key.trim().to_owned())
            .collect();
        for key in &keys {
            if let Err(e) = validate_key(key) {
                bail!("GENID_KEYS contains an invalid key: {e}");
            }
        }

        if args.max_connections == Some(0) {
            bail!("GENID_MAX_CONNECTIONS must be greater than 0");
        }

        let store = match args.engine {
            Engine::Memory => StoreConfig::Memory,
            Engine::Sqlite => {
                let mut sqlite = SqliteConfig::new(&args.dsn)
                    .with_table(&args.table)
                    .with_busy_timeout(Duration::from_millis(args.busy_timeout_ms));
                if let Some(n) = args.max_connections {
                    sqlite = sqlite.with_max_connections(n);
                }
                StoreConfig::Sqlite(sqlite)
            }
            #[cfg(feature = "postgres")]
            Engine::Postgres => {
                let mut pg = genid::store::PgConfig::new(&args.dsn).with_table(&args.table);
                if let Some(n) = args.max_connections {
                    pg = pg.with_max_connections(n);
                }
                StoreConfig::Postgres(pg)
            }
            #[cfg(not(feature = "postgres"))]
            Engine::Postgres => {
                bail!("the postgres engine requires building with the `postgres` feature")
            }
        };

        Ok(Self {
            mode: args.command.unwrap_or_default(),
            store,
            step: args.step,
            keys,
            server_addr: args.server_addr,
            uds: args.uds,
            pid_file: args.pid_file,
            rw_timeout: millis(args.rw_timeout_ms),
            idle_timeout: millis(args.idle_timeout_ms),
        })
    }
}

/// `0` means "no limit".
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(std::iter::once("genid-server").chain(argv.iter().copied()))?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn defaults_to_run_on_sqlite() {
        let config = parse(&["--dsn", "ids.db", "--step", "100"]).unwrap();
        assert_eq!(config.mode, Mode::Run);
        assert_eq!(config.step, 100);
        assert!(!config.uds);
        let StoreConfig::Sqlite(sqlite) = config.store else {
            panic!("expected sqlite store");
        };
        assert_eq!(sqlite.table, DEFAULT_TABLE);
        assert_eq!(sqlite.busy_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn init_subcommand_and_memory_engine() {
        let config = parse(&["--engine", "memory", "init"]).unwrap();
        assert_eq!(config.mode, Mode::Init);
        assert!(matches!(config.store, StoreConfig::Memory));
    }

    #[test]
    fn keys_are_split_and_trimmed() {
        let config = parse(&["--keys", "order, user"]).unwrap();
        assert_eq!(config.keys, vec!["order".to_owned(), "user".to_owned()]);
    }

    #[test]
    fn timeouts_are_off_unless_set() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.rw_timeout, None);
        assert_eq!(config.idle_timeout, None);

        let config = parse(&["--rw-timeout-ms", "1500", "--idle-timeout-ms", "0"]).unwrap();
        assert_eq!(config.rw_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.idle_timeout, None);

        let config = parse(&["--idle-timeout-ms", "30000"]).unwrap();
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn max_connections_reaches_the_store() {
        let config = parse(&["--max-connections", "2"]).unwrap();
        let StoreConfig::Sqlite(sqlite) = config.store else {
            panic!("expected sqlite store");
        };
        assert_eq!(sqlite.max_connections, 2);
        assert!(parse(&["--max-connections", "0"]).is_err());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--step", "0"]).is_err());
        assert!(parse(&["--keys", "order,,user"]).is_err());
        assert!(parse(&["--keys", &"k".repeat(33)]).is_err());
        assert!(parse(&["--engine", "redis"]).is_err());
    }
}
