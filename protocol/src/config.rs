//! # Fork Resolution Configuration & Constants
//!
//! Every tunable that governs when a fork replaces the master chain lives
//! here. Per-chain values travel in [`ChainParameters`]; the constants below
//! are the defaults a node falls back to when its configuration file leaves
//! a field out.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one independently tracked block sequence (one per network or
/// shard the node participates in).
pub type ChainId = u32;

// ---------------------------------------------------------------------------
// Switch Policy Defaults
// ---------------------------------------------------------------------------

/// A fork must lead the master tip by at least this many blocks before the
/// monitor switches to it. Forks within this band are usually two producers
/// racing at the same height over a slow link, and they settle on their own.
pub const DEFAULT_CHAIN_SWITCH_THRESHOLD: u64 = 3;

/// Forks whose tip trails the master tip by more than this many blocks are
/// evicted by the cleaner. They will never catch up in practice.
pub const DEFAULT_HEIGHT_RANGE: u64 = 1_000;

/// Deepest rollback a single switch may perform. A fork that diverged further
/// back than this is refused outright.
pub const DEFAULT_MAX_ROLLBACK: u64 = 1_000;

/// Maximum number of fork chains retained per chain identifier. When a new
/// branch would exceed it, the shortest (then oldest) fork is dropped.
pub const DEFAULT_MAX_FORK_CHAINS: usize = 128;

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Cadence of the fork monitor, in milliseconds.
pub const FORK_MONITOR_INTERVAL_MS: u64 = 10_000;

/// Cadence of the fork cleaner, in milliseconds. Pruning is cheap but
/// rarely urgent.
pub const FORK_CLEANER_INTERVAL_MS: u64 = 60_000;

/// Consecutive failed optimistic attempts (stamp invalidated or escalation
/// refused) after which the monitor stops being polite and takes the
/// exclusive guard directly for that chain.
pub const OPTIMISTIC_RETRY_LIMIT: u32 = 8;

// ---------------------------------------------------------------------------
// ChainParameters
// ---------------------------------------------------------------------------

/// Per-chain tunables. Loaded by the node from its configuration file and
/// handed to the [`ChainContext`](crate::context::ChainContext) at
/// registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParameters {
    /// Minimum `fork.end_height - master.end_height` that triggers a switch.
    pub chain_switch_threshold: u64,

    /// How far behind the master tip a fork may fall before it is pruned.
    pub height_range: u64,

    /// Deepest rollback a switch may perform on the master chain.
    pub max_rollback: u64,

    /// Cap on retained fork chains for this identifier.
    pub max_fork_chains: usize,
}

impl Default for ChainParameters {
    fn default() -> Self {
        Self {
            chain_switch_threshold: DEFAULT_CHAIN_SWITCH_THRESHOLD,
            height_range: DEFAULT_HEIGHT_RANGE,
            max_rollback: DEFAULT_MAX_ROLLBACK,
            max_fork_chains: DEFAULT_MAX_FORK_CHAINS,
        }
    }
}

/// Rejected parameter combinations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A chain that may never roll back can never switch.
    #[error("max_rollback must be at least 1")]
    ZeroRollback,

    /// Without room for a single fork there is nothing to monitor.
    #[error("max_fork_chains must be at least 1")]
    NoForkCapacity,

    /// The cleaner would evict forks before they could ever qualify.
    #[error("height_range ({height_range}) must not be below chain_switch_threshold ({threshold})")]
    RangeBelowThreshold {
        /// Configured pruning range.
        height_range: u64,
        /// Configured switch threshold.
        threshold: u64,
    },
}

impl ChainParameters {
    /// Checks the parameters for combinations that make fork resolution
    /// impossible or self-defeating.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rollback == 0 {
            return Err(ConfigError::ZeroRollback);
        }
        if self.max_fork_chains == 0 {
            return Err(ConfigError::NoForkCapacity);
        }
        if self.height_range < self.chain_switch_threshold {
            return Err(ConfigError::RangeBelowThreshold {
                height_range: self.height_range,
                threshold: self.chain_switch_threshold,
            });
        }
        Ok(())
    }
}
