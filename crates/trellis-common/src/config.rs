//! Configuration bundle for a term tree.

use crate::error::{Result, TrellisError};
use serde::{Deserialize, Serialize};

/// Key/value layout of a tree, fixed for the lifetime of a tree instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMode {
    /// Numeric keys mapping to per-permutation coordinate sets.
    Coordinates,
    /// Numeric keys mapping to a single 64-bit payload.
    NumericValues,
    /// Byte-string keys mapping to a single 64-bit payload.
    TextKeys,
}

/// Configuration supplied when opening a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Maximum number of keys stored in a node.
    pub max_elements_per_node: usize,
    /// Keys are byte strings instead of 64-bit identifiers.
    pub text_keys: bool,
    /// Values are single 64-bit payloads instead of coordinate sets.
    pub text_values: bool,
    /// Maximum number of nodes tracked by the node cache.
    pub max_nodes_in_cache: usize,
    /// Size threshold after which a new node data file is started.
    pub file_max_size: u64,
    /// Number of coordinate cells allocated at once when the pool is empty.
    pub coordinate_pool_batch: usize,
    /// Maximum number of released coordinate cells kept for reuse.
    pub coordinate_pool_retain: usize,
    /// Maximum number of released arrays kept for reuse, per pool.
    pub array_pool_retain: usize,
    /// Open the tree without write access.
    pub read_only: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_elements_per_node: 2048,
            text_keys: false,
            text_values: false,
            max_nodes_in_cache: 1024,
            file_max_size: 64 * 1024 * 1024, // 64 MB
            coordinate_pool_batch: 256,
            coordinate_pool_retain: 65536,
            array_pool_retain: 64,
            read_only: false,
        }
    }
}

impl TreeConfig {
    /// Smallest legal node branching factor.
    pub const MIN_BRANCHING: usize = 4;

    /// Returns the minimum occupancy of a non-root node.
    pub fn min_elements_per_node(&self) -> usize {
        self.max_elements_per_node / 2
    }

    /// Returns the key/value layout selected by the mode flags.
    pub fn mode(&self) -> TreeMode {
        if self.text_keys {
            TreeMode::TextKeys
        } else if self.text_values {
            TreeMode::NumericValues
        } else {
            TreeMode::Coordinates
        }
    }

    /// Checks the bundle for values the tree cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_elements_per_node < Self::MIN_BRANCHING {
            return Err(TrellisError::Config(format!(
                "max_elements_per_node must be at least {}, got {}",
                Self::MIN_BRANCHING,
                self.max_elements_per_node
            )));
        }
        if self.max_elements_per_node % 2 != 0 {
            return Err(TrellisError::Config(format!(
                "max_elements_per_node must be even, got {}",
                self.max_elements_per_node
            )));
        }
        if self.max_nodes_in_cache == 0 {
            return Err(TrellisError::Config(
                "max_nodes_in_cache must be positive".to_string(),
            ));
        }
        if self.file_max_size == 0 {
            return Err(TrellisError::Config(
                "file_max_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_config_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.max_elements_per_node, 2048);
        assert_eq!(config.min_elements_per_node(), 1024);
        assert!(!config.text_keys);
        assert!(!config.text_values);
        assert!(!config.read_only);
        assert_eq!(config.file_max_size, 64 * 1024 * 1024);
        assert_eq!(config.mode(), TreeMode::Coordinates);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tree_mode_selection() {
        let config = TreeConfig {
            text_values: true,
            ..Default::default()
        };
        assert_eq!(config.mode(), TreeMode::NumericValues);

        // Text keys win over text values
        let config = TreeConfig {
            text_keys: true,
            text_values: true,
            ..Default::default()
        };
        assert_eq!(config.mode(), TreeMode::TextKeys);
    }

    #[test]
    fn test_validate_rejects_small_branching() {
        let config = TreeConfig {
            max_elements_per_node: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrellisError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_odd_branching() {
        let config = TreeConfig {
            max_elements_per_node: 7,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrellisError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_cache() {
        let config = TreeConfig {
            max_nodes_in_cache: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tree_config_serde_roundtrip() {
        let original = TreeConfig {
            max_elements_per_node: 64,
            text_keys: true,
            read_only: true,
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: TreeConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.max_elements_per_node, deserialized.max_elements_per_node);
        assert_eq!(original.text_keys, deserialized.text_keys);
        assert_eq!(original.read_only, deserialized.read_only);
        assert_eq!(original.file_max_size, deserialized.file_max_size);
    }
}
