use std::sync::Arc;

use cxo_store::ObjectStore;
use cxo_types::{Hash, SchemaRef};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::config::PackConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::schema::{Schema, SchemaRegistry};

/// Everything a reference needs to load and save objects: a store, the
/// schemas, and the load configuration for `Refs` trees.
pub trait Pack {
    /// Read an object. A missing object is [`RegistryError::NotFound`].
    fn get(&self, key: &Hash) -> RegistryResult<Vec<u8>>;

    /// Save an object under its content hash.
    fn set(&self, key: Hash, value: Vec<u8>) -> RegistryResult<()>;

    fn schema(&self, sr: &SchemaRef) -> RegistryResult<Arc<Schema>>;

    fn config(&self) -> &PackConfig;

    /// Save bytes and return their hash.
    fn add(&self, value: Vec<u8>) -> RegistryResult<Hash> {
        let key = Hash::digest(&value);
        self.set(key, value)?;
        Ok(key)
    }

    /// Read and decode an object.
    fn get_value<T: DeserializeOwned>(&self, key: &Hash) -> RegistryResult<T> {
        codec::decode(&self.get(key)?)
    }

    /// Encode and save a value, returning its hash.
    fn add_value<T: Serialize + ?Sized>(&self, value: &T) -> RegistryResult<Hash> {
        self.add(codec::encode(value)?)
    }
}

/// [`Pack`] over a shared object store and schema registry.
///
/// Every `set` adds one reference to the stored object.
pub struct StorePack<S, R> {
    store: Arc<S>,
    registry: Arc<R>,
    config: PackConfig,
}

impl<S: ObjectStore, R: SchemaRegistry> StorePack<S, R> {
    pub fn new(store: Arc<S>, registry: Arc<R>, config: PackConfig) -> RegistryResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            registry,
            config,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Same store and registry with different configuration.
    pub fn with_config(&self, config: PackConfig) -> RegistryResult<Self> {
        Self::new(self.store.clone(), self.registry.clone(), config)
    }
}

impl<S: ObjectStore, R: SchemaRegistry> Pack for StorePack<S, R> {
    fn get(&self, key: &Hash) -> RegistryResult<Vec<u8>> {
        self.store.get(key)?.ok_or(RegistryError::NotFound(*key))
    }

    fn set(&self, key: Hash, value: Vec<u8>) -> RegistryResult<()> {
        self.store.set(key, value, 1)?;
        Ok(())
    }

    fn schema(&self, sr: &SchemaRef) -> RegistryResult<Arc<Schema>> {
        self.registry.schema_by_ref(sr)
    }

    fn config(&self) -> &PackConfig {
        &self.config
    }
}

impl<S, R> std::fmt::Debug for StorePack<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePack")
            .field("config", &self.config)
            .finish()
    }
}
