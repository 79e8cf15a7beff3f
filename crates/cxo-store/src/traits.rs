use cxo_types::Hash;

use crate::error::StoreResult;

/// Content-addressed, reference-counted object store.
///
/// All implementations must satisfy these invariants:
/// - Values are immutable once written; a key always maps to the same bytes.
/// - Each key carries a reference count of its logical owners. An object
///   whose count drops to zero is removed.
/// - Individual key operations are atomic with respect to each other, so
///   concurrent fill tasks may share one store.
/// - The store never interprets object contents.
pub trait ObjectStore: Send + Sync {
    /// Read an object by key. Returns `Ok(None)` if it does not exist.
    fn get(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>>;

    /// Read an object and add `inc` to its reference count in one step.
    ///
    /// Returns the value and the reference count after the increment, or
    /// `Ok(None)` if the object does not exist (nothing is changed then).
    fn get_inc(&self, key: &Hash, inc: u32) -> StoreResult<Option<(Vec<u8>, u32)>>;

    /// Store an object and add `inc` to its reference count.
    ///
    /// Writing an existing key only bumps the count. Returns the count after
    /// the write. With `inc == 0` an absent object is not stored.
    fn set(&self, key: Hash, value: Vec<u8>, inc: u32) -> StoreResult<u32>;

    /// Change the reference count of an existing object by `delta`.
    ///
    /// Returns the new count; the object is removed when it reaches zero.
    fn increment(&self, key: &Hash, delta: i64) -> StoreResult<u32>;

    /// Current reference count, zero if the object is absent.
    fn refcount(&self, key: &Hash) -> StoreResult<u32>;

    /// Check whether an object exists in the store.
    fn contains(&self, key: &Hash) -> StoreResult<bool> {
        Ok(self.refcount(key)? > 0)
    }

    /// Store a value under its own content hash with a count of one.
    fn add(&self, value: Vec<u8>) -> StoreResult<Hash> {
        let key = Hash::digest(&value);
        self.set(key, value, 1)?;
        Ok(key)
    }
}
