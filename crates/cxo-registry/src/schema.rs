//! Structural description of stored types.
//!
//! A [`Schema`] knows enough about a type's layout to size its encoding and
//! to find the references embedded in it. Walk and fill use it to slice a
//! flat byte buffer into fields and elements without decoding values.

use std::collections::HashMap;
use std::sync::Arc;

use cxo_types::{Hash, SchemaRef, HASH_LEN};
use serde::{Deserialize, Serialize};

use crate::codec::{self, read_length, LENGTH_PREFIX};
use crate::error::{RegistryError, RegistryResult};

/// Scalar types of the canonical codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Length-prefixed UTF-8.
    String,
    /// Length-prefixed bytes.
    Bytes,
}

impl ScalarKind {
    /// Encoded width, or `None` for length-prefixed kinds.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ScalarKind::Bool | ScalarKind::U8 | ScalarKind::I8 => Some(1),
            ScalarKind::U16 | ScalarKind::I16 => Some(2),
            ScalarKind::U32 | ScalarKind::I32 | ScalarKind::F32 => Some(4),
            ScalarKind::U64 | ScalarKind::I64 | ScalarKind::F64 => Some(8),
            ScalarKind::String | ScalarKind::Bytes => None,
        }
    }
}

/// Which kind of reference a reference schema is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    /// [`Ref`](crate::Ref): one typed pointer.
    Single,
    /// [`Refs`](crate::Refs): an ordered sequence of typed pointers.
    Slice,
    /// [`Dynamic`](crate::Dynamic): pointer plus schema.
    Dynamic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Scalar,
    Array,
    Slice,
    Struct,
    Reference(ReferenceKind),
}

/// Named struct field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: Arc<Schema>,
}

/// Layout of a stored type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schema {
    Scalar(ScalarKind),
    /// Fixed number of consecutive elements, no prefix.
    Array { len: usize, elem: Arc<Schema> },
    /// Length-prefixed sequence of elements.
    Slice { elem: Arc<Schema> },
    Struct { name: String, fields: Vec<Field> },
    /// `Ref` to an object of `elem`.
    Ref { elem: Arc<Schema> },
    /// `Refs` whose elements are objects of `elem`.
    Refs { elem: Arc<Schema> },
    /// `Dynamic`; the element schema travels with the reference.
    Dynamic,
}

impl Schema {
    pub fn scalar(kind: ScalarKind) -> Self {
        Schema::Scalar(kind)
    }

    pub fn array(len: usize, elem: Schema) -> Self {
        Schema::Array {
            len,
            elem: Arc::new(elem),
        }
    }

    pub fn slice(elem: Schema) -> Self {
        Schema::Slice {
            elem: Arc::new(elem),
        }
    }

    pub fn structure(name: &str, fields: Vec<(&str, Schema)>) -> Self {
        Schema::Struct {
            name: name.to_string(),
            fields: fields
                .into_iter()
                .map(|(name, schema)| Field {
                    name: name.to_string(),
                    schema: Arc::new(schema),
                })
                .collect(),
        }
    }

    pub fn ref_to(elem: Schema) -> Self {
        Schema::Ref {
            elem: Arc::new(elem),
        }
    }

    pub fn refs_of(elem: Schema) -> Self {
        Schema::Refs {
            elem: Arc::new(elem),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Schema::Scalar(_) => Kind::Scalar,
            Schema::Array { .. } => Kind::Array,
            Schema::Slice { .. } => Kind::Slice,
            Schema::Struct { .. } => Kind::Struct,
            Schema::Ref { .. } => Kind::Reference(ReferenceKind::Single),
            Schema::Refs { .. } => Kind::Reference(ReferenceKind::Slice),
            Schema::Dynamic => Kind::Reference(ReferenceKind::Dynamic),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind(), Kind::Reference(_))
    }

    /// Struct name, if this is a struct.
    pub fn name(&self) -> Option<&str> {
        match self {
            Schema::Struct { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Whether an encoding of this type can contain any reference.
    pub fn has_references(&self) -> bool {
        match self {
            Schema::Scalar(_) => false,
            Schema::Array { len, elem } => *len > 0 && elem.has_references(),
            Schema::Slice { elem } => elem.has_references(),
            Schema::Struct { fields, .. } => fields.iter().any(|f| f.schema.has_references()),
            Schema::Ref { .. } | Schema::Refs { .. } | Schema::Dynamic => true,
        }
    }

    /// Element schema of arrays, slices and typed references.
    pub fn element_schema(&self) -> Option<&Arc<Schema>> {
        match self {
            Schema::Array { elem, .. }
            | Schema::Slice { elem }
            | Schema::Ref { elem }
            | Schema::Refs { elem } => Some(elem),
            _ => None,
        }
    }

    pub fn fields(&self) -> &[Field] {
        match self {
            Schema::Struct { fields, .. } => fields,
            _ => &[],
        }
    }

    /// Encoded width when it does not depend on the data.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Schema::Scalar(kind) => kind.fixed_size(),
            Schema::Array { len, elem } => elem.fixed_size()?.checked_mul(*len),
            Schema::Slice { .. } => None,
            Schema::Struct { fields, .. } => fields
                .iter()
                .try_fold(0usize, |n, f| n.checked_add(f.schema.fixed_size()?)),
            Schema::Ref { .. } | Schema::Refs { .. } => Some(HASH_LEN),
            Schema::Dynamic => Some(2 * HASH_LEN),
        }
    }

    /// Number of bytes at the start of `bytes` that encode one value.
    pub fn encoded_size(&self, bytes: &[u8]) -> RegistryResult<usize> {
        let n = match self {
            Schema::Scalar(kind) => match kind.fixed_size() {
                Some(n) => n,
                None => LENGTH_PREFIX
                    .checked_add(read_length(bytes)?)
                    .ok_or_else(|| overflow("scalar length"))?,
            },
            Schema::Array { len, elem } => sequence_size(elem, *len, bytes)?,
            Schema::Slice { elem } => {
                let len = read_length(bytes)?;
                LENGTH_PREFIX
                    .checked_add(sequence_size(elem, len, &bytes[LENGTH_PREFIX..])?)
                    .ok_or_else(|| overflow("slice size"))?
            }
            Schema::Struct { fields, .. } => {
                let mut n = 0;
                for field in fields {
                    n += field.schema.encoded_size(&bytes[n..])?;
                }
                n
            }
            Schema::Ref { .. } | Schema::Refs { .. } => HASH_LEN,
            Schema::Dynamic => 2 * HASH_LEN,
        };
        if n > bytes.len() {
            return Err(RegistryError::InvalidSchemaOrData(format!(
                "{n} bytes needed, {} available",
                bytes.len()
            )));
        }
        Ok(n)
    }

    /// Split a sequence encoding (array body, or slice body after its
    /// prefix) into the encodings of its `count` elements.
    pub fn split_elements<'a>(
        elem: &Schema,
        count: usize,
        mut bytes: &'a [u8],
    ) -> RegistryResult<Vec<&'a [u8]>> {
        let mut out = Vec::new();
        for _ in 0..count {
            let n = elem.encoded_size(bytes)?;
            let (head, tail) = bytes.split_at(n);
            out.push(head);
            bytes = tail;
        }
        Ok(out)
    }

    /// Split a struct encoding into `(field, bytes)` pairs.
    pub fn split_fields<'s, 'a>(
        &'s self,
        mut bytes: &'a [u8],
    ) -> RegistryResult<Vec<(&'s Field, &'a [u8])>> {
        let mut out = Vec::new();
        for field in self.fields() {
            let n = field.schema.encoded_size(bytes)?;
            let (head, tail) = bytes.split_at(n);
            out.push((field, head));
            bytes = tail;
        }
        Ok(out)
    }

    /// Content-addressed reference to this schema.
    pub fn schema_ref(&self) -> RegistryResult<SchemaRef> {
        Ok(SchemaRef::from(Hash::digest(&codec::encode(self)?)))
    }
}

fn overflow(what: &str) -> RegistryError {
    RegistryError::InvalidSchemaOrData(format!("{what} overflows"))
}

fn sequence_size(elem: &Schema, count: usize, bytes: &[u8]) -> RegistryResult<usize> {
    if let Some(fixed) = elem.fixed_size() {
        return fixed
            .checked_mul(count)
            .ok_or_else(|| overflow("sequence size"));
    }
    let mut n = 0;
    for _ in 0..count {
        n += elem.encoded_size(&bytes[n..])?;
    }
    Ok(n)
}

/// Read access to registered schemas.
pub trait SchemaRegistry: Send + Sync {
    fn schema_by_ref(&self, sr: &SchemaRef) -> RegistryResult<Arc<Schema>>;
}

/// In-memory schema registry.
#[derive(Debug, Default)]
pub struct Registry {
    by_ref: HashMap<SchemaRef, Arc<Schema>>,
    by_name: HashMap<String, SchemaRef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema and return its reference. Struct schemas are also
    /// reachable by name.
    pub fn register(&mut self, schema: Schema) -> RegistryResult<SchemaRef> {
        let sr = schema.schema_ref()?;
        if let Some(name) = schema.name() {
            self.by_name.insert(name.to_string(), sr);
        }
        self.by_ref.entry(sr).or_insert_with(|| Arc::new(schema));
        Ok(sr)
    }

    pub fn ref_by_name(&self, name: &str) -> RegistryResult<SchemaRef> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::SchemaNameNotFound(name.to_string()))
    }

    pub fn schema_by_name(&self, name: &str) -> RegistryResult<Arc<Schema>> {
        let sr = self.ref_by_name(name)?;
        self.schema_by_ref(&sr)
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }
}

impl SchemaRegistry for Registry {
    fn schema_by_ref(&self, sr: &SchemaRef) -> RegistryResult<Arc<Schema>> {
        self.by_ref
            .get(sr)
            .cloned()
            .ok_or(RegistryError::SchemaNotFound(*sr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::{Dynamic, Ref};
    use serde::Serialize;

    fn user_schema() -> Schema {
        Schema::structure(
            "User",
            vec![
                ("name", Schema::scalar(ScalarKind::String)),
                ("age", Schema::scalar(ScalarKind::U32)),
                ("tags", Schema::slice(Schema::scalar(ScalarKind::String))),
            ],
        )
    }

    #[derive(Serialize)]
    struct User {
        name: String,
        age: u32,
        tags: Vec<String>,
    }

    #[test]
    fn kinds_and_references() {
        let user = user_schema();
        assert_eq!(user.kind(), Kind::Struct);
        assert!(!user.has_references());

        let linked = Schema::structure(
            "Post",
            vec![
                ("author", Schema::ref_to(user.clone())),
                ("body", Schema::scalar(ScalarKind::String)),
            ],
        );
        assert!(linked.has_references());
        assert_eq!(
            linked.fields()[0].schema.kind(),
            Kind::Reference(ReferenceKind::Single)
        );
        assert_eq!(
            Schema::refs_of(user.clone()).kind(),
            Kind::Reference(ReferenceKind::Slice)
        );
        assert_eq!(Schema::Dynamic.kind(), Kind::Reference(ReferenceKind::Dynamic));
        assert!(!Schema::array(0, Schema::Dynamic).has_references());
        assert_eq!(
            Schema::slice(user.clone()).element_schema().map(|s| s.as_ref()),
            Some(&user)
        );
    }

    #[test]
    fn encoded_size_matches_codec() {
        let user = User {
            name: "alice".into(),
            age: 30,
            tags: vec!["a".into(), "bcd".into()],
        };
        let mut bytes = encode(&user).unwrap();
        let n = bytes.len();
        bytes.extend_from_slice(b"trailing");
        assert_eq!(user_schema().encoded_size(&bytes).unwrap(), n);
    }

    #[test]
    fn reference_sizes() {
        let r = encode(&Ref::default()).unwrap();
        let d = encode(&Dynamic::default()).unwrap();
        assert_eq!(Schema::ref_to(user_schema()).encoded_size(&r).unwrap(), 32);
        assert_eq!(Schema::Dynamic.encoded_size(&d).unwrap(), 64);
        assert_eq!(Schema::array(3, Schema::Dynamic).fixed_size(), Some(192));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let bytes = encode(&("abcdef".to_string(), 1u32)).unwrap();
        let schema = Schema::structure(
            "Pair",
            vec![
                ("s", Schema::scalar(ScalarKind::String)),
                ("n", Schema::scalar(ScalarKind::U32)),
            ],
        );
        assert!(matches!(
            schema.encoded_size(&bytes[..bytes.len() - 1]),
            Err(RegistryError::InvalidSchemaOrData(_))
        ));
    }

    #[test]
    fn split_fields_slices_struct() {
        let user = User {
            name: "bob".into(),
            age: 7,
            tags: vec![],
        };
        let bytes = encode(&user).unwrap();
        let schema = user_schema();
        let parts = schema.split_fields(&bytes).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].0.name, "name");
        assert_eq!(parts[0].1, encode("bob").unwrap().as_slice());
        assert_eq!(parts[1].1, 7u32.to_le_bytes());
    }

    #[test]
    fn registry_lookup() {
        let mut reg = Registry::new();
        let sr = reg.register(user_schema()).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(*reg.schema_by_ref(&sr).unwrap(), user_schema());
        assert_eq!(reg.ref_by_name("User").unwrap(), sr);
        assert!(matches!(
            reg.schema_by_ref(&SchemaRef::from(Hash::digest(b"other"))),
            Err(RegistryError::SchemaNotFound(_))
        ));
        assert!(matches!(
            reg.schema_by_name("Nope"),
            Err(RegistryError::SchemaNameNotFound(_))
        ));
    }

    #[test]
    fn schema_ref_is_stable() {
        assert_eq!(
            user_schema().schema_ref().unwrap(),
            user_schema().schema_ref().unwrap()
        );
        assert_ne!(
            user_schema().schema_ref().unwrap(),
            Schema::Dynamic.schema_ref().unwrap()
        );
    }
}
