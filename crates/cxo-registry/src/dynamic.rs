use std::fmt;
use std::ops::ControlFlow;

use cxo_types::{Hash, SchemaRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};
use crate::pack::Pack;
use crate::walk::{self, WalkFn, WalkStep};

/// Typed "any" pointer: an object hash plus the schema of the object.
///
/// Valid states are blank (both zero), typed nil (schema set, hash zero)
/// and set (both non-zero). A hash without a schema is invalid.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dynamic {
    pub hash: Hash,
    pub schema: SchemaRef,
}

impl Dynamic {
    pub fn new(hash: Hash, schema: SchemaRef) -> Self {
        Self { hash, schema }
    }

    pub fn is_valid(&self) -> bool {
        !(self.schema.is_zero() && !self.hash.is_zero())
    }

    /// Blank means both parts are zero.
    pub fn is_blank(&self) -> bool {
        self.hash.is_zero() && self.schema.is_zero()
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(RegistryError::InvalidDynamicReference)
        }
    }

    pub fn short(&self) -> String {
        format!("{}:{}", self.schema.short_hex(), self.hash.short_hex())
    }

    pub fn value<P: Pack, T: DeserializeOwned>(&self, pack: &P) -> RegistryResult<T> {
        self.validate()?;
        if self.hash.is_zero() {
            return Err(RegistryError::ReferenceRepresentsNil);
        }
        pack.get_value(&self.hash)
    }

    /// Store `value` (described by `schema`) and point to it. `None` keeps
    /// the schema and makes the object nil.
    pub fn set_value<P: Pack, T: Serialize>(
        &mut self,
        pack: &P,
        schema: SchemaRef,
        value: Option<&T>,
    ) -> RegistryResult<()> {
        let hash = match value {
            Some(v) => pack.add_value(v)?,
            None => Hash::ZERO,
        };
        self.schema = schema;
        self.hash = hash;
        self.validate()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Visit this reference (depth 0) and, if asked, the object's graph
    /// using the schema the reference carries.
    pub fn walk<P: Pack>(&self, pack: &P, f: &mut WalkFn<'_>) -> RegistryResult<()> {
        self.walk_from(pack, f).map(|_| ())
    }

    pub(crate) fn walk_from<P: Pack>(
        &self,
        pack: &P,
        f: &mut WalkFn<'_>,
    ) -> RegistryResult<ControlFlow<()>> {
        self.validate()?;
        match f(self.hash, 0)? {
            WalkStep::Stop => Ok(ControlFlow::Break(())),
            WalkStep::Skip => Ok(ControlFlow::Continue(())),
            WalkStep::Deeper if self.hash.is_zero() => Ok(ControlFlow::Continue(())),
            WalkStep::Deeper => {
                let schema = pack.schema(&self.schema)?;
                walk::walk_hash(pack, &schema, self.hash, f)
            }
        }
    }
}

impl fmt::Debug for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dynamic({})", self.short())
    }
}

impl fmt::Display for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}
