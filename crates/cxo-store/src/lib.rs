//! Content-addressed object storage for CXO.
//!
//! Every object (struct encodings, Merkle nodes of `Refs` trees, roots'
//! targets) is stored under the BLAKE3 hash of its bytes together with a
//! reference count of its owners. Fill operations bump counts while they
//! work so that a concurrent collector cannot reclaim half-filled graphs,
//! and roll them back on failure.
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectStore`] trait:
//!
//! - [`InMemoryObjectStore`] -- `HashMap`-based store for tests and embedding
//!
//! On-disk engines live outside this workspace and plug in through the same
//! trait.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryObjectStore;
pub use traits::ObjectStore;
