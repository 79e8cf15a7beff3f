//! Foundation types for the CXO object store.
//!
//! Every other CXO crate depends on `cxo-types`.
//!
//! # Key Types
//!
//! - [`Hash`]: content hash (BLAKE3) of an object's canonical encoding;
//!   the zero hash means "no object"
//! - [`SchemaRef`]: reference to a registered schema

pub mod error;
pub mod hash;
pub mod schema_ref;

pub use error::TypeError;
pub use hash::{Hash, HASH_LEN};
pub use schema_ref::SchemaRef;
