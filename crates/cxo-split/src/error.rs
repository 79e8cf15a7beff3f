use cxo_registry::RegistryError;
use cxo_store::StoreError;
use cxo_types::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FillError {
    /// The fill was cancelled while work was pending.
    #[error("fill terminated")]
    Terminated,

    /// A filler runs a single fill.
    #[error("fill already started")]
    AlreadyStarted,

    #[error("delivered object hashes to {actual}, expected {expected}")]
    HashMismatch { expected: Hash, actual: Hash },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type FillResult<T> = Result<T, FillError>;
