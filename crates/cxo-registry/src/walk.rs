//! Schema-guided, depth-first traversal of an object graph.
//!
//! The visitor sees every hash the graph is made of, including internal
//! nodes of `Refs` trees. Element and reference hashes are reported with
//! depth 0, `Refs` nodes with their height in the tree (root at
//! `depth + 1`). Walking never writes to the store.

use std::ops::ControlFlow;

use cxo_types::Hash;

use crate::codec::{self, read_length, LENGTH_PREFIX};
use crate::dynamic::Dynamic;
use crate::error::RegistryResult;
use crate::pack::Pack;
use crate::reference::Ref;
use crate::refs::Refs;
use crate::schema::Schema;

/// What the visitor wants after seeing a hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkStep {
    /// Descend into the object behind this hash.
    Deeper,
    /// Do not descend; continue with siblings.
    Skip,
    /// End the whole walk. Not an error.
    Stop,
}

/// Walk visitor: receives `(hash, depth)`.
pub type WalkFn<'a> = dyn FnMut(Hash, usize) -> RegistryResult<WalkStep> + 'a;

pub(crate) fn step(flow: ControlFlow<()>) -> bool {
    flow.is_continue()
}

/// Walk the object stored under `hash`. The hash itself has already been
/// reported to the visitor.
pub(crate) fn walk_hash<P: Pack>(
    pack: &P,
    schema: &Schema,
    hash: Hash,
    f: &mut WalkFn<'_>,
) -> RegistryResult<ControlFlow<()>> {
    if hash.is_zero() || !schema.has_references() {
        return Ok(ControlFlow::Continue(()));
    }
    let bytes = pack.get(&hash)?;
    walk_data(pack, schema, &bytes, f)
}

/// Walk the references embedded in one encoded value.
pub(crate) fn walk_data<P: Pack>(
    pack: &P,
    schema: &Schema,
    bytes: &[u8],
    f: &mut WalkFn<'_>,
) -> RegistryResult<ControlFlow<()>> {
    if !schema.has_references() {
        return Ok(ControlFlow::Continue(()));
    }
    match schema {
        Schema::Ref { elem } => {
            let r: Ref = codec::decode(bytes)?;
            r.walk_from(pack, elem, f)
        }
        Schema::Refs { elem } => {
            let mut refs: Refs = codec::decode(bytes)?;
            refs.walk_from(pack, Some(elem), f)
        }
        Schema::Dynamic => {
            let d: Dynamic = codec::decode(bytes)?;
            d.walk_from(pack, f)
        }
        Schema::Array { len, elem } => walk_elements(pack, elem, *len, bytes, f),
        Schema::Slice { elem } => {
            let len = read_length(bytes)?;
            walk_elements(pack, elem, len, &bytes[LENGTH_PREFIX..], f)
        }
        Schema::Struct { .. } => {
            for (field, part) in schema.split_fields(bytes)? {
                if field.schema.has_references()
                    && !step(walk_data(pack, &field.schema, part, f)?)
                {
                    return Ok(ControlFlow::Break(()));
                }
            }
            Ok(ControlFlow::Continue(()))
        }
        Schema::Scalar(_) => Ok(ControlFlow::Continue(())),
    }
}

fn walk_elements<P: Pack>(
    pack: &P,
    elem: &Schema,
    count: usize,
    bytes: &[u8],
    f: &mut WalkFn<'_>,
) -> RegistryResult<ControlFlow<()>> {
    for part in Schema::split_elements(elem, count, bytes)? {
        if !step(walk_data(pack, elem, part, f)?) {
            return Ok(ControlFlow::Break(()));
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Walk an encoded value of `schema` that is not itself stored, such as a
/// struct held by the caller.
pub fn walk_value<P: Pack>(
    pack: &P,
    schema: &Schema,
    bytes: &[u8],
    f: &mut WalkFn<'_>,
) -> RegistryResult<()> {
    walk_data(pack, schema, bytes, f).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::config::{PackConfig, RefsFlags};
    use crate::pack::testing::{pack, pack_with};
    use crate::schema::{ScalarKind, SchemaRegistry};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;

    #[derive(Serialize, Deserialize)]
    struct Post {
        title: String,
    }

    #[derive(Serialize)]
    struct Feed {
        name: String,
        pinned: Ref,
        posts: Refs,
        extra: Vec<Dynamic>,
    }

    fn post_schema() -> Schema {
        Schema::structure("Post", vec![("title", Schema::scalar(ScalarKind::String))])
    }

    fn feed_schema() -> Schema {
        Schema::structure(
            "Feed",
            vec![
                ("name", Schema::scalar(ScalarKind::String)),
                ("pinned", Schema::ref_to(post_schema())),
                ("posts", Schema::refs_of(post_schema())),
                ("extra", Schema::slice(Schema::Dynamic)),
            ],
        )
    }

    fn post(title: &str) -> Post {
        Post {
            title: title.into(),
        }
    }

    #[test]
    fn walks_every_reference() {
        let pack = pack_with(PackConfig {
            degree: 2,
            flags: RefsFlags::default(),
        });
        let mut pinned = Ref::default();
        pinned.set_value(&pack, Some(&post("pinned"))).unwrap();

        let mut posts = Refs::with_degree(2).unwrap();
        let items: Vec<Option<Post>> = vec![Some(post("a")), Some(post("b")), Some(post("c"))];
        posts.append_values(&pack, &items).unwrap();

        let feed = Feed {
            name: "news".into(),
            pinned,
            posts: posts.clone(),
            extra: vec![Dynamic::default()],
        };
        let bytes = encode(&feed).unwrap();

        let mut seen = Vec::new();
        walk_value(&pack, &feed_schema(), &bytes, &mut |h, d| {
            seen.push((h, d));
            Ok(WalkStep::Deeper)
        })
        .unwrap();

        // pinned, refs root, 2 branch nodes, 3 elements, blank dynamic
        assert_eq!(seen.len(), 8);
        assert_eq!(seen[0], (pinned.hash, 0));
        assert_eq!(seen[1], (posts.hash(), 2));
        assert_eq!(seen.iter().filter(|(_, d)| *d == 1).count(), 2);
        assert_eq!(seen.last(), Some(&(Hash::ZERO, 0)));

        let elements: HashSet<Hash> = seen
            .iter()
            .filter(|(h, d)| *d == 0 && !h.is_zero() && *h != pinned.hash)
            .map(|(h, _)| *h)
            .collect();
        assert_eq!(elements.len(), 3);
    }

    #[test]
    fn stop_ends_walk() {
        let pack = pack();
        let mut posts = Refs::default();
        let items: Vec<Option<Post>> = (0..5).map(|i| Some(post(&i.to_string()))).collect();
        posts.append_values(&pack, &items).unwrap();

        let mut calls = 0;
        posts
            .walk(&pack, &mut |_, d| {
                calls += 1;
                Ok(if d == 0 { WalkStep::Stop } else { WalkStep::Deeper })
            })
            .unwrap();
        // root, first element
        assert_eq!(calls, 2);
    }

    #[test]
    fn skip_prunes_subtree() {
        let pack = pack_with(PackConfig {
            degree: 2,
            flags: RefsFlags::default(),
        });
        let mut posts = Refs::with_degree(2).unwrap();
        let items: Vec<Option<Post>> = (0..4).map(|i| Some(post(&i.to_string()))).collect();
        posts.append_values(&pack, &items).unwrap();

        let root = posts.hash();
        let mut seen = Vec::new();
        posts
            .walk(&pack, &mut |h, d| {
                seen.push(d);
                Ok(if h == root { WalkStep::Deeper } else { WalkStep::Skip })
            })
            .unwrap();
        // root, then its two branches without their leaves
        assert_eq!(seen, vec![2, 1, 1]);
    }

    #[test]
    fn dynamic_resolves_schema_through_registry() {
        let mut registry = crate::schema::Registry::new();
        let holder = Schema::structure("Holder", vec![("inner", Schema::ref_to(post_schema()))]);
        let sr = registry.register(holder).unwrap();
        let pack = crate::pack::StorePack::new(
            std::sync::Arc::new(cxo_store::InMemoryObjectStore::new()),
            std::sync::Arc::new(registry),
            PackConfig::default(),
        )
        .unwrap();

        let mut inner = Ref::default();
        inner.set_value(&pack, Some(&post("deep"))).unwrap();
        let mut dynamic = Dynamic::default();
        dynamic.set_value(&pack, sr, Some(&inner)).unwrap();
        assert!(pack.registry().schema_by_ref(&sr).is_ok());

        let mut seen = Vec::new();
        dynamic
            .walk(&pack, &mut |h, d| {
                seen.push((h, d));
                Ok(WalkStep::Deeper)
            })
            .unwrap();
        assert_eq!(seen, vec![(dynamic.hash, 0), (inner.hash, 0)]);
    }

    #[test]
    fn missing_object_surfaces_not_found() {
        let pack = pack();
        let r = Ref::new(Hash::digest(b"absent"));
        let schema = Schema::ref_to(Schema::structure(
            "Holder",
            vec![("next", Schema::ref_to(post_schema()))],
        ));
        let err = walk_value(&pack, &schema, &encode(&r).unwrap(), &mut |_, _| {
            Ok(WalkStep::Deeper)
        })
        .unwrap_err();
        assert!(matches!(err, crate::RegistryError::NotFound(_)));
    }
}
