use serde::{Deserialize, Serialize};

use crate::error::{FillError, FillResult};

/// Default number of subtree tasks a fill may run at once.
pub const DEFAULT_MAX_PARALLEL: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillConfig {
    /// Ceiling on concurrently running subtree tasks; `0` means unbounded.
    /// Work that finds the ceiling reached runs inline on its parent.
    pub max_parallel: usize,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

impl FillConfig {
    pub fn unbounded() -> Self {
        Self { max_parallel: 0 }
    }

    pub fn from_toml(s: &str) -> FillResult<Self> {
        toml::from_str(s).map_err(|e| FillError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(FillConfig::default().max_parallel, 10);
        assert_eq!(FillConfig::unbounded().max_parallel, 0);
    }

    #[test]
    fn parse_toml() {
        let config = FillConfig::from_toml("max_parallel = 3").unwrap();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(FillConfig::from_toml("").unwrap(), FillConfig::default());
        assert!(matches!(
            FillConfig::from_toml("max_parallel = -1"),
            Err(FillError::Config(_))
        ));
    }
}
