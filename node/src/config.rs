//! # Node Configuration
//!
//! The node reads a single JSON file listing the chains it follows and the
//! cadence of its background tasks. Every field has a default, so a file
//! holding `{}` is valid and yields one chain with the protocol defaults.
//!
//! ```json
//! {
//!   "monitor_interval_ms": 10000,
//!   "cleaner_interval_ms": 60000,
//!   "chains": [
//!     { "chain_id": 1, "chain_switch_threshold": 3, "height_range": 1000 }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use forkwatch_protocol::config::{
    ChainId, ChainParameters, FORK_CLEANER_INTERVAL_MS, FORK_MONITOR_INTERVAL_MS,
    OPTIMISTIC_RETRY_LIMIT,
};

/// One followed chain and its tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    #[serde(flatten)]
    pub parameters: ChainParameters,
}

/// Top-level node configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Milliseconds between fork monitor cycles.
    pub monitor_interval_ms: u64,
    /// Milliseconds between fork cleaner cycles.
    pub cleaner_interval_ms: u64,
    /// Optimistic attempts per chain before the monitor blocks.
    pub optimistic_retry_limit: u32,
    /// Chains to follow.
    pub chains: Vec<ChainConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: FORK_MONITOR_INTERVAL_MS,
            cleaner_interval_ms: FORK_CLEANER_INTERVAL_MS,
            optimistic_retry_limit: OPTIMISTIC_RETRY_LIMIT,
            chains: vec![ChainConfig {
                chain_id: 1,
                parameters: ChainParameters::default(),
            }],
        }
    }
}

impl NodeConfig {
    /// Reads and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the default configuration to `path`. Refuses to overwrite an
    /// existing file unless `force` is set.
    pub fn write_default(path: &Path, force: bool) -> Result<Self> {
        if path.exists() && !force {
            bail!(
                "config file {} already exists (use --force to overwrite)",
                path.display()
            );
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let config = Self::default();
        let body = serde_json::to_string_pretty(&config).context("failed to encode config")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(config)
    }

    /// Structural checks. Per-chain parameters are validated when the
    /// chain is registered.
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            bail!("config lists no chains");
        }
        if self.monitor_interval_ms == 0 || self.cleaner_interval_ms == 0 {
            bail!("task intervals must be non-zero");
        }
        let mut seen = BTreeSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                bail!("chain {} is listed twice", chain.chain_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn chain_parameters_are_flattened() {
        let config: NodeConfig = serde_json::from_str(
            r#"{ "chains": [ { "chain_id": 7, "chain_switch_threshold": 20 } ] }"#,
        )
        .unwrap();
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].chain_id, 7);
        assert_eq!(config.chains[0].parameters.chain_switch_threshold, 20);
        assert_eq!(
            config.chains[0].parameters.height_range,
            ChainParameters::default().height_range
        );
    }

    #[test]
    fn write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("forkwatch.json");
        let written = NodeConfig::write_default(&path, false).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), written);
    }

    #[test]
    fn existing_file_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forkwatch.json");
        NodeConfig::write_default(&path, false).unwrap();
        assert!(NodeConfig::write_default(&path, false).is_err());
        assert!(NodeConfig::write_default(&path, true).is_ok());
    }

    #[test]
    fn duplicate_chain_ids_rejected() {
        let config: NodeConfig = serde_json::from_str(
            r#"{ "chains": [ { "chain_id": 1 }, { "chain_id": 1 } ] }"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = NodeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn empty_chain_list_rejected() {
        let config = NodeConfig {
            chains: vec![],
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
