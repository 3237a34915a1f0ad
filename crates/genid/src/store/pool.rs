use std::time::Duration;

use parking_lot::RwLock;
use r2d2::{ManageConnection, Pool, PooledConnection};

use super::StoreError;

/// Default time a checkout waits for a free connection.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bounded pool of database connections.
///
/// Each reservation checks out its own connection, so transactions for
/// different keys run side by side instead of queueing on one handle. At most
/// `max_size` connections exist at once; a checkout beyond that waits up to
/// the connect timeout. Connections are validated on checkout and replaced if
/// the backend dropped them. Closing drops the pool; connections already
/// checked out are released when their guards drop.
pub(crate) struct ConnectionPool<M: ManageConnection> {
    inner: RwLock<Option<Pool<M>>>,
    max_size: u32,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Builds the pool and opens one connection before returning, so a bad
    /// path or DSN fails here rather than on the first reservation.
    pub(crate) fn new(
        manager: M,
        max_size: u32,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let max_size = max_size.max(1);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .test_on_check_out(true)
            .connection_timeout(connect_timeout.max(Duration::from_millis(1)))
            .build(manager)?;
        Ok(Self {
            inner: RwLock::new(Some(pool)),
            max_size,
        })
    }

    pub(crate) fn get(&self) -> Result<PooledConnection<M>, StoreError> {
        // Clone the handle so a waiting checkout does not hold the lock.
        let pool = self.inner.read().clone().ok_or(StoreError::Closed)?;
        Ok(pool.get()?)
    }

    pub(crate) const fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Drops idle connections and refuses further checkouts.
    pub(crate) fn close(&self) {
        self.inner.write().take();
    }
}
