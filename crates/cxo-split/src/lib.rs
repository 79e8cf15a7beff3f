//! Concurrent fill for CXO.
//!
//! A fill materializes the object graph below a root when only part of it
//! is stored locally. Missing objects are requested on a want stream and
//! handed back with [`Filler::deliver`]; [`serve_wants`] connects that
//! stream to an [`ObjectSource`]. Subtrees whose root is already owned by
//! someone else are assumed complete and are not descended into.

pub mod config;
pub mod error;
pub mod filler;
pub mod source;
pub mod types;

pub use config::{FillConfig, DEFAULT_MAX_PARALLEL};
pub use error::{FillError, FillResult};
pub use filler::Filler;
pub use source::{serve_wants, ObjectSource, StoreSource};
pub use types::{FillReport, FillState};
