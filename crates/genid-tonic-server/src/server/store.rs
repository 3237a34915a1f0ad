use std::sync::Arc;

use anyhow::Context;
use genid::store::SqliteCounterStore;
use genid::{CounterStore, MemoryCounterStore, Registry};

use crate::server::config::{ServerConfig, StoreConfig};

/// The registry type served by the binary; the backend is picked at runtime.
pub type SharedRegistry = Registry<dyn CounterStore>;

/// Opens the configured counter store. Blocking.
pub fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config {
        StoreConfig::Memory => Arc::new(MemoryCounterStore::new()),
        StoreConfig::Sqlite(sqlite) => Arc::new(
            SqliteCounterStore::open(sqlite.clone())
                .with_context(|| format!("failed to open {}", sqlite.path.display()))?,
        ),
        #[cfg(feature = "postgres")]
        StoreConfig::Postgres(pg) => Arc::new(
            genid::store::PgCounterStore::connect(pg.clone())
                .context("failed to connect to postgres")?,
        ),
    };
    Ok(store)
}

/// Creates the counter table and releases the store. Blocking.
pub fn init_schema(config: &ServerConfig) -> anyhow::Result<()> {
    let store = open_store(&config.store)?;
    store
        .create_schema()
        .context("failed to create the counter table")?;
    store.close()?;
    Ok(())
}

/// Opens the store and enables the configured keys. Blocking.
///
/// Every key gets its first segment here, so a store that is unreachable or
/// missing its table fails startup rather than the first request.
pub fn build_registry(config: &ServerConfig) -> anyhow::Result<SharedRegistry> {
    let store = open_store(&config.store)?;
    let registry = Registry::new(store, config.step)?;
    registry
        .enable_keys(&config.keys)
        .context("failed to enable keys (has `genid-server init` been run?)")?;
    Ok(registry)
}
