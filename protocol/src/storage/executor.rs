//! The state machine blocks are applied to.
//!
//! Whatever the node builds on top of its master chain (ledger balances,
//! transaction indexes, consensus bookkeeping) is reached through
//! [`BlockExecutor`]. The registry applies master-chain blocks through it and
//! walks it backwards and forwards during a switch. The executor is expected
//! to be strictly stack-like: `rollback` only ever undoes the most recently
//! applied block.
//!
//! [`JournalExecutor`] is the in-memory implementation shipped with the
//! crate. It keeps, per chain, the stack of applied block hashes and a
//! running state root `root_n = BLAKE3(root_{n-1} || hash_n)`, so two
//! executors that applied the same blocks in the same order agree on the
//! root, and any divergence is visible.

use dashmap::DashMap;
use thiserror::Error;

use super::block::{blake3_hash, short_hash, BlockHeader};
use crate::config::ChainId;

/// Failures reported by a [`BlockExecutor`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The executor refused the block (validation, state conflict, I/O).
    #[error("block {height} rejected: {reason}")]
    Rejected {
        /// Height of the refused block.
        height: u64,
        /// Human-readable cause.
        reason: String,
    },

    /// The block does not build on the executor's current tip.
    #[error("block {height} does not extend executor tip {tip}")]
    NotOnTip {
        /// Height of the offending block.
        height: u64,
        /// Short hash of the executor's tip.
        tip: String,
    },

    /// Rollback requested for a block that is not the executor's tip.
    #[error("cannot roll back block {height}: executor tip is {tip}")]
    OutOfOrder {
        /// Height of the requested block.
        height: u64,
        /// Short hash of the executor's tip, or "empty".
        tip: String,
    },
}

/// Applies and reverts blocks for one or more chain identifiers.
pub trait BlockExecutor: Send + Sync {
    /// Applies `block` on top of the current state of `chain_id`.
    fn apply(&self, chain_id: ChainId, block: &BlockHeader) -> Result<(), ExecutionError>;

    /// Reverts `block`, which must be the most recently applied one.
    fn rollback(&self, chain_id: ChainId, block: &BlockHeader) -> Result<(), ExecutionError>;
}

#[derive(Debug, Default)]
struct Journal {
    /// `(block hash, state root after it)`, oldest first.
    entries: Vec<([u8; 32], [u8; 32])>,
}

impl Journal {
    fn root(&self) -> [u8; 32] {
        self.entries.last().map(|(_, root)| *root).unwrap_or([0u8; 32])
    }

    fn tip_label(&self) -> String {
        self.entries
            .last()
            .map(|(hash, _)| short_hash(hash))
            .unwrap_or_else(|| "empty".to_string())
    }
}

/// In-memory, hash-chained journal of applied blocks. Entries are never
/// compacted, so memory grows with chain height; meant for devnets and tests.
#[derive(Debug, Default)]
pub struct JournalExecutor {
    journals: DashMap<ChainId, Journal>,
}

impl JournalExecutor {
    /// Creates an executor with no applied blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state root of `chain_id` (zeros before the first block).
    pub fn state_root(&self, chain_id: ChainId) -> [u8; 32] {
        self.journals
            .get(&chain_id)
            .map(|j| j.root())
            .unwrap_or([0u8; 32])
    }

    /// Number of blocks currently applied for `chain_id`.
    pub fn depth(&self, chain_id: ChainId) -> usize {
        self.journals
            .get(&chain_id)
            .map(|j| j.entries.len())
            .unwrap_or(0)
    }

    /// Hash of the most recently applied block for `chain_id`.
    pub fn tip(&self, chain_id: ChainId) -> Option<[u8; 32]> {
        self.journals
            .get(&chain_id)
            .and_then(|j| j.entries.last().map(|(hash, _)| *hash))
    }
}

impl BlockExecutor for JournalExecutor {
    fn apply(&self, chain_id: ChainId, block: &BlockHeader) -> Result<(), ExecutionError> {
        let mut journal = self.journals.entry(chain_id).or_default();
        if let Some((tip, _)) = journal.entries.last() {
            if *tip != block.parent_hash {
                return Err(ExecutionError::NotOnTip {
                    height: block.height,
                    tip: journal.tip_label(),
                });
            }
        }
        let mut preimage = [0u8; 64];
        preimage[..32].copy_from_slice(&journal.root());
        preimage[32..].copy_from_slice(&block.hash);
        let root = blake3_hash(&preimage);
        journal.entries.push((block.hash, root));
        Ok(())
    }

    fn rollback(&self, chain_id: ChainId, block: &BlockHeader) -> Result<(), ExecutionError> {
        let mut journal = self.journals.entry(chain_id).or_default();
        let on_tip = journal
            .entries
            .last()
            .map(|(tip, _)| *tip == block.hash)
            .unwrap_or(false);
        if !on_tip {
            return Err(ExecutionError::OutOfOrder {
                height: block.height,
                tip: journal.tip_label(),
            });
        }
        journal.entries.pop();
        Ok(())
    }
}
