use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Reference to a registered schema: the content hash of its encoding.
///
/// The zero value means "no schema".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaRef(pub Hash);

impl SchemaRef {
    pub const ZERO: SchemaRef = SchemaRef(Hash::ZERO);

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn hash(&self) -> Hash {
        self.0
    }

    pub fn short_hex(&self) -> String {
        self.0.short_hex()
    }
}

impl fmt::Debug for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaRef({})", self.0.short_hex())
    }
}

impl fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Hash> for SchemaRef {
    fn from(hash: Hash) -> Self {
        Self(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_schema_ref() {
        assert!(SchemaRef::ZERO.is_zero());
        assert!(SchemaRef::default().is_zero());
        assert!(!SchemaRef::from(Hash::digest(b"schema")).is_zero());
    }

    #[test]
    fn debug_uses_short_hex() {
        let sr = SchemaRef::from(Hash::digest(b"schema"));
        assert_eq!(format!("{sr:?}"), format!("SchemaRef({})", sr.short_hex()));
    }
}
