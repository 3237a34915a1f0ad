use crate::Result;

/// A minimal interface for issuing per-key monotonic identifiers.
///
/// [`Registry`](crate::Registry) is the production implementation; the
/// protocol adapter only depends on this trait.
pub trait KeyedGenerator: Send + Sync {
    /// Replaces the set of servable keys. All-or-nothing: on error the
    /// previously enabled keys keep working unchanged.
    fn enable_keys(&self, keys: &[String]) -> Result<()>;

    /// Issues the next identifier for `key`.
    fn next(&self, key: &str) -> Result<i64>;

    /// Returns the last identifier issued for `key` without allocating.
    fn current(&self, key: &str) -> Result<i64>;

    /// Releases the backing store. Further calls fail.
    fn close(&self) -> Result<()>;
}
