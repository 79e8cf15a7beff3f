use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = 32;

/// Content hash of an object's canonical encoding.
///
/// A `Hash` is the BLAKE3 digest of the encoded bytes and is the key the
/// object is stored under. The all-zero hash is a reserved sentinel meaning
/// "no object"; it is never looked up in a store.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// The zero hash. Represents "absent" or "nil".
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    /// Hash the given bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a pre-computed digest.
    pub const fn from_raw(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns `true` for the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 7 characters), for logs and listings.
    pub fn short_hex(&self) -> String {
        let mut s = hex::encode(&self.0[..4]);
        s.truncate(7);
        s
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != HASH_LEN {
            return Err(TypeError::InvalidLength {
                expected: HASH_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; HASH_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for [u8; HASH_LEN] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}
