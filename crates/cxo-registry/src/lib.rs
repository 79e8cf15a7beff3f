//! Schema-typed references and the `Refs` Merkle sequence.
//!
//! Objects stored in CXO point at each other through three reference
//! types:
//!
//! - [`Ref`] -- optional pointer to one object of a known schema
//! - [`Dynamic`] -- pointer plus the schema of the target
//! - [`Refs`] -- ordered sequence of pointers, stored as a Merkle tree of
//!   bounded degree so appends and edits re-hash one path instead of the
//!   whole sequence
//!
//! References load and save through a [`Pack`]: an object store, a schema
//! registry and the load configuration. [`walk`] traverses a graph guided
//! by schemas; the concurrent, network-aware counterpart lives in
//! `cxo-split`.

pub mod codec;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod pack;
pub mod reference;
pub mod refs;
pub mod root;
pub mod schema;
pub mod walk;

pub use config::{PackConfig, RefsFlags, DEFAULT_DEGREE, MAX_DEGREE, MIN_DEGREE};
pub use dynamic::Dynamic;
pub use error::{RegistryError, RegistryResult};
pub use pack::{Pack, StorePack};
pub use reference::Ref;
pub use refs::{EncodedRefs, EncodedRefsNode, Refs, RefsCursor};
pub use root::Root;
pub use schema::{Field, Kind, ReferenceKind, Registry, ScalarKind, Schema, SchemaRegistry};
pub use walk::{walk_value, WalkFn, WalkStep};
