use cxo_store::StoreError;
use cxo_types::{Hash, SchemaRef};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// An object the graph points to is absent from the store.
    #[error("object not found: {0}")]
    NotFound(Hash),

    /// No element of a `Refs` carries the requested hash.
    #[error("element not found: {0}")]
    ElementNotFound(Hash),

    /// The element exists but its hash is zero.
    #[error("element is nil")]
    ElementIsNil,

    /// Reading the value of a blank `Ref` or `Dynamic`.
    #[error("reference represents nil")]
    ReferenceRepresentsNil,

    /// A stored `Refs` node is inconsistent with its children.
    #[error("malformed refs: {0}")]
    MalformedRefs(String),

    #[error("invalid degree {degree}: must be in [{min}, {max}]")]
    InvalidDegree { degree: usize, min: usize, max: usize },

    #[error("index {index} out of range for length {length}")]
    IndexOutOfRange { index: usize, length: usize },

    #[error("invalid slice range [{start}:{end}]")]
    InvalidSliceRange { start: usize, end: usize },

    /// A `Dynamic` with an object hash but no schema.
    #[error("invalid dynamic reference: object hash set but schema is blank")]
    InvalidDynamicReference,

    /// A structural rebuild was requested while the tree is being iterated.
    #[error("refs is being iterated")]
    RefsIterating,

    /// Deferred changes must be persisted with `rebuild` first.
    #[error("refs has unsaved changes")]
    RefsDirty,

    #[error("schema not found: {0}")]
    SchemaNotFound(SchemaRef),

    #[error("schema not found by name: {0}")]
    SchemaNameNotFound(String),

    /// Encoded bytes do not fit the schema that is supposed to describe them.
    #[error("invalid schema or data: {0}")]
    InvalidSchemaOrData(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
