use cxo_types::Hash;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    NotFound(Hash),

    /// The value does not hash to the key it was stored under.
    #[error("hash mismatch for {key}: computed {computed}")]
    HashMismatch { key: Hash, computed: Hash },

    /// A decrement would take the reference count below zero.
    #[error("refcount underflow for {key}: {refcount} + {delta}")]
    RefcountUnderflow { key: Hash, refcount: u32, delta: i64 },

    /// Attempted to store an object under the zero hash.
    #[error("cannot store object under the zero hash")]
    NullKey,

    /// Failure reported by a storage backend.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
