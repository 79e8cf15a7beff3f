//! Canonical binary encoding.
//!
//! Objects are encoded with `bincode`'s default options: fixed-width little
//! endian integers and `u64` length prefixes on strings and sequences. The
//! schema layer relies on this layout to size encodings without decoding
//! them.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RegistryError, RegistryResult};

/// Width of a length prefix.
pub const LENGTH_PREFIX: usize = 8;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> RegistryResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| RegistryError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RegistryResult<T> {
    bincode::deserialize(bytes).map_err(|e| RegistryError::Codec(e.to_string()))
}

/// Read the length prefix at the start of `bytes`.
pub fn read_length(bytes: &[u8]) -> RegistryResult<usize> {
    let prefix: [u8; LENGTH_PREFIX] = bytes
        .get(..LENGTH_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| RegistryError::InvalidSchemaOrData("truncated length prefix".into()))?;
    usize::try_from(u64::from_le_bytes(prefix))
        .map_err(|_| RegistryError::InvalidSchemaOrData("length prefix overflows".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_has_u64_prefix() {
        let bytes = encode("abc").unwrap();
        assert_eq!(bytes.len(), LENGTH_PREFIX + 3);
        assert_eq!(read_length(&bytes).unwrap(), 3);
    }

    #[test]
    fn truncated_prefix_is_rejected() {
        assert!(matches!(
            read_length(&[1, 2, 3]),
            Err(RegistryError::InvalidSchemaOrData(_))
        ));
    }

    #[test]
    fn decode_garbage_is_codec_error() {
        let err = decode::<String>(&[0xff; 4]).unwrap_err();
        assert!(matches!(err, RegistryError::Codec(_)));
    }
}
