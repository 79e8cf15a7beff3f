use std::fmt;
use std::ops::ControlFlow;

use cxo_types::Hash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};
use crate::pack::Pack;
use crate::schema::Schema;
use crate::walk::{self, WalkFn, WalkStep};

/// Optional pointer to one stored object.
///
/// A zero hash means the field points to nothing. Setting a value stores
/// its encoding and swaps the hash; the previous object is left alone.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub hash: Hash,
}

impl Ref {
    pub fn new(hash: Hash) -> Self {
        Self { hash }
    }

    pub fn is_blank(&self) -> bool {
        self.hash.is_zero()
    }

    pub fn short(&self) -> String {
        self.hash.short_hex()
    }

    /// Load and decode the referenced object.
    pub fn value<P: Pack, T: DeserializeOwned>(&self, pack: &P) -> RegistryResult<T> {
        if self.is_blank() {
            return Err(RegistryError::ReferenceRepresentsNil);
        }
        pack.get_value(&self.hash)
    }

    /// Store `value` and point to it; `None` makes the reference blank.
    pub fn set_value<P: Pack, T: Serialize>(
        &mut self,
        pack: &P,
        value: Option<&T>,
    ) -> RegistryResult<()> {
        self.hash = match value {
            Some(v) => pack.add_value(v)?,
            None => Hash::ZERO,
        };
        Ok(())
    }

    pub fn clear(&mut self) {
        self.hash = Hash::ZERO;
    }

    /// Visit this reference (depth 0) and, if asked, the graph below it.
    /// `elem` is the schema of the referenced object.
    pub fn walk<P: Pack>(&self, pack: &P, elem: &Schema, f: &mut WalkFn<'_>) -> RegistryResult<()> {
        self.walk_from(pack, elem, f).map(|_| ())
    }

    pub(crate) fn walk_from<P: Pack>(
        &self,
        pack: &P,
        elem: &Schema,
        f: &mut WalkFn<'_>,
    ) -> RegistryResult<ControlFlow<()>> {
        match f(self.hash, 0)? {
            WalkStep::Stop => Ok(ControlFlow::Break(())),
            WalkStep::Skip => Ok(ControlFlow::Continue(())),
            WalkStep::Deeper => walk::walk_hash(pack, elem, self.hash, f),
        }
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self.short())
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}
