use std::collections::HashMap;
use std::sync::RwLock;

use cxo_types::Hash;
use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    refcount: u32,
}

/// In-memory, HashMap-based object store.
///
/// Intended for tests and embedding. Objects are held behind a `RwLock`;
/// values are cloned on read.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<Hash, Entry>>,
}

impl InMemoryObjectStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(|e| e.value.len() as u64)
            .sum()
    }

    /// Remove all objects from the store.
    pub fn clear(&self) {
        self.objects.write().expect("lock poisoned").clear();
    }

    /// Return a sorted list of all keys in the store.
    pub fn all_keys(&self) -> Vec<Hash> {
        let map = self.objects.read().expect("lock poisoned");
        let mut keys: Vec<Hash> = map.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Snapshot of every key with its reference count, sorted by key.
    pub fn refcounts(&self) -> Vec<(Hash, u32)> {
        let map = self.objects.read().expect("lock poisoned");
        let mut counts: Vec<(Hash, u32)> = map.iter().map(|(k, e)| (*k, e.refcount)).collect();
        counts.sort();
        counts
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(key).map(|e| e.value.clone()))
    }

    fn get_inc(&self, key: &Hash, inc: u32) -> StoreResult<Option<(Vec<u8>, u32)>> {
        let mut map = self.objects.write().expect("lock poisoned");
        Ok(map.get_mut(key).map(|e| {
            e.refcount = e.refcount.saturating_add(inc);
            (e.value.clone(), e.refcount)
        }))
    }

    fn set(&self, key: Hash, value: Vec<u8>, inc: u32) -> StoreResult<u32> {
        if key.is_zero() {
            return Err(StoreError::NullKey);
        }
        let computed = Hash::digest(&value);
        if computed != key {
            return Err(StoreError::HashMismatch { key, computed });
        }
        let mut map = self.objects.write().expect("lock poisoned");
        if let Some(entry) = map.get_mut(&key) {
            entry.refcount = entry.refcount.saturating_add(inc);
            return Ok(entry.refcount);
        }
        if inc == 0 {
            return Ok(0);
        }
        trace!(key = %key.short_hex(), size = value.len(), "store object");
        map.insert(
            key,
            Entry {
                value,
                refcount: inc,
            },
        );
        Ok(inc)
    }

    fn increment(&self, key: &Hash, delta: i64) -> StoreResult<u32> {
        let mut map = self.objects.write().expect("lock poisoned");
        let entry = map.get_mut(key).ok_or(StoreError::NotFound(*key))?;
        let next = i64::from(entry.refcount) + delta;
        if next < 0 {
            return Err(StoreError::RefcountUnderflow {
                key: *key,
                refcount: entry.refcount,
                delta,
            });
        }
        if next == 0 {
            map.remove(key);
            trace!(key = %key.short_hex(), "object released");
            return Ok(0);
        }
        entry.refcount = u32::try_from(next).unwrap_or(u32::MAX);
        Ok(entry.refcount)
    }

    fn refcount(&self, key: &Hash) -> StoreResult<u32> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(key).map(|e| e.refcount).unwrap_or(0))
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("InMemoryObjectStore")
            .field("object_count", &count)
            .finish()
    }
}
