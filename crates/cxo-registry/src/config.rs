use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// Smallest allowed `Refs` degree.
pub const MIN_DEGREE: usize = 2;

/// Largest allowed `Refs` degree. Bounds the size of a single node that a
/// peer can make us load.
pub const MAX_DEGREE: usize = 256;

/// Degree used for new trees when nothing else is configured.
pub const DEFAULT_DEGREE: usize = 16;

/// How a `Refs` tree is held in memory once loaded.
///
/// Flags are captured when a tree is initialized. A tree must be reset
/// before different flags take effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefsFlags {
    /// Keep a hash -> leaves index. Implies loading the entire tree.
    pub hash_table_index: bool,
    /// Load the entire tree on initialization instead of on demand.
    pub entire_refs: bool,
    /// Defer hash recomputation after mutations until `rebuild`.
    pub lazy_updating: bool,
}

impl RefsFlags {
    /// Flags that keep every node in memory with an index.
    pub fn indexed() -> Self {
        Self {
            hash_table_index: true,
            entire_refs: true,
            lazy_updating: false,
        }
    }

    /// Whether initialization must load the whole tree.
    pub fn loads_entire_tree(&self) -> bool {
        self.entire_refs || self.hash_table_index
    }
}

/// Configuration of a [`Pack`](crate::Pack).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Degree of newly created `Refs` trees.
    pub degree: usize,
    /// Load flags applied to trees initialized through the pack.
    pub flags: RefsFlags,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            degree: DEFAULT_DEGREE,
            flags: RefsFlags::default(),
        }
    }
}

impl PackConfig {
    pub fn with_flags(flags: RefsFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml(s: &str) -> RegistryResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| RegistryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RegistryResult<()> {
        validate_degree(self.degree)
    }
}

/// Reject degrees outside `[MIN_DEGREE, MAX_DEGREE]`.
pub fn validate_degree(degree: usize) -> RegistryResult<()> {
    if !(MIN_DEGREE..=MAX_DEGREE).contains(&degree) {
        return Err(RegistryError::InvalidDegree {
            degree,
            min: MIN_DEGREE,
            max: MAX_DEGREE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = PackConfig::default();
        assert_eq!(c.degree, 16);
        assert_eq!(c.flags, RefsFlags::default());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn index_implies_entire_tree() {
        assert!(RefsFlags::indexed().loads_entire_tree());
        let flags = RefsFlags {
            hash_table_index: true,
            ..Default::default()
        };
        assert!(flags.loads_entire_tree());
        assert!(!RefsFlags::default().loads_entire_tree());
    }

    #[test]
    fn degree_bounds() {
        assert!(validate_degree(1).is_err());
        assert!(validate_degree(2).is_ok());
        assert!(validate_degree(256).is_ok());
        assert!(matches!(
            validate_degree(257),
            Err(RegistryError::InvalidDegree { degree: 257, .. })
        ));
    }

    #[test]
    fn from_toml_partial() {
        let c = PackConfig::from_toml("degree = 4\n[flags]\nlazy_updating = true\n").unwrap();
        assert_eq!(c.degree, 4);
        assert!(c.flags.lazy_updating);
        assert!(!c.flags.hash_table_index);
    }

    #[test]
    fn from_toml_rejects_bad_degree() {
        assert!(matches!(
            PackConfig::from_toml("degree = 1"),
            Err(RegistryError::InvalidDegree { .. })
        ));
        assert!(matches!(
            PackConfig::from_toml("degree = \"many\""),
            Err(RegistryError::Config(_))
        ));
    }
}
