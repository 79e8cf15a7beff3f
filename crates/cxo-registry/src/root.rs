use cxo_types::Hash;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::dynamic::Dynamic;
use crate::error::RegistryResult;
use crate::pack::Pack;
use crate::walk::WalkFn;

/// Entry point of a feed's object graph.
///
/// Signing and feed bookkeeping happen elsewhere; this type only carries
/// what traversal needs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub refs: Vec<Dynamic>,
    /// Application-defined bytes.
    pub descriptor: Vec<u8>,
    pub seq: u64,
    /// Unix time in nanoseconds.
    pub timestamp: i64,
    /// Hash of the previous root of the feed, zero for the first.
    pub prev: Hash,
}

impl Root {
    pub fn encode(&self) -> RegistryResult<Vec<u8>> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> RegistryResult<Self> {
        codec::decode(bytes)
    }

    pub fn hash(&self) -> RegistryResult<Hash> {
        Ok(Hash::digest(&self.encode()?))
    }

    pub fn short(&self) -> String {
        match self.hash() {
            Ok(h) => format!("{}:{}", self.seq, h.short_hex()),
            Err(_) => format!("{}:?", self.seq),
        }
    }

    pub fn validate(&self) -> RegistryResult<()> {
        self.refs.iter().try_for_each(Dynamic::validate)
    }

    /// Walk every `Dynamic` of the root in order.
    pub fn walk<P: Pack>(&self, pack: &P, f: &mut WalkFn<'_>) -> RegistryResult<()> {
        self.validate()?;
        for dynamic in &self.refs {
            if dynamic.walk_from(pack, f)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::testing::pack;
    use crate::schema::{Registry, ScalarKind, Schema};
    use crate::walk::WalkStep;
    use crate::{Pack, RegistryError};
    use cxo_types::SchemaRef;

    #[test]
    fn encode_decode() {
        let root = Root {
            refs: vec![Dynamic::new(Hash::ZERO, SchemaRef::from(Hash::digest(b"s")))],
            descriptor: b"feed".to_vec(),
            seq: 3,
            timestamp: 1_700_000_000,
            prev: Hash::digest(b"prev"),
        };
        let back = Root::decode(&root.encode().unwrap()).unwrap();
        assert_eq!(back, root);
        assert!(root.short().starts_with("3:"));
    }

    #[test]
    fn walk_visits_each_dynamic() {
        let mut registry = Registry::new();
        let sr = registry
            .register(Schema::scalar(ScalarKind::String))
            .unwrap();
        let pack = crate::pack::StorePack::new(
            pack().store().clone(),
            std::sync::Arc::new(registry),
            Default::default(),
        )
        .unwrap();
        let mut first = Dynamic::default();
        first.set_value(&pack, sr, Some(&"one".to_string())).unwrap();
        let mut second = Dynamic::default();
        second.set_value(&pack, sr, Some(&"two".to_string())).unwrap();
        let root = Root {
            refs: vec![first, second],
            ..Default::default()
        };

        let mut seen = Vec::new();
        root.walk(&pack, &mut |h, _| {
            seen.push(h);
            Ok(WalkStep::Stop)
        })
        .unwrap();
        assert_eq!(seen, vec![first.hash]);
        assert!(pack.get(&second.hash).is_ok());
    }

    #[test]
    fn invalid_dynamic_is_rejected() {
        let root = Root {
            refs: vec![Dynamic::new(Hash::digest(b"o"), SchemaRef::ZERO)],
            ..Default::default()
        };
        assert!(matches!(
            root.validate(),
            Err(RegistryError::InvalidDynamicReference)
        ));
    }
}
