use crate::store::StoreError;

/// A result type defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Longest key the counter table accepts (`VARCHAR(32)`), in bytes.
pub const MAX_KEY_LEN: usize = 32;

/// All errors the registry and its segment engines can surface.
///
/// Lookup failures ([`Error::KeyNotRegistered`]) are kept apart from store
/// failures ([`Error::Store`]) so a caller can decide between re-enabling the
/// key and treating the failure as an outage.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The segment size is not a positive integer.
    #[error("invalid step: {0}")]
    InvalidStep(i64),

    /// A key passed to `enable_keys` cannot be stored in the counter table.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// The key has not been enabled on this registry.
    #[error("key {0:?} does not exist")]
    KeyNotRegistered(String),

    /// The registry was closed and its store released.
    #[error("generator is closed")]
    Closed,

    /// Reserving a segment failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Returns `true` when the failure is a missing registration rather than
    /// a store or configuration problem.
    pub fn is_not_registered(&self) -> bool {
        matches!(self, Self::KeyNotRegistered(_))
    }

    /// Returns `true` when the failure came from the counter store.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Checks that `key` fits the counter table's `key` column.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey {
            key: key.to_owned(),
            reason: "key must not be empty",
        });
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKey {
            key: key.to_owned(),
            reason: "key exceeds 32 bytes",
        });
    }
    Ok(())
}
