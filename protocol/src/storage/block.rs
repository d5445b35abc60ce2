//! # Block Headers
//!
//! The fork-resolution core never looks inside a block body. Everything it
//! needs (height, linkage, identity) lives in the header, so that is all this
//! module models. Transaction payloads are represented only by the Merkle
//! root over their hashes.
//!
//! ## Header Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  BlockHeader                                │
//! │  ├── height: u64                            │
//! │  ├── hash: [u8; 32]       (BLAKE3 of fields)│
//! │  ├── parent_hash: [u8; 32]                  │
//! │  ├── timestamp: u64                         │
//! │  ├── producer: String                       │
//! │  └── tx_root: [u8; 32]   (Merkle root)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The hash covers `height || parent_hash || timestamp || producer || tx_root`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ChainId;

/// BLAKE3 digest as a fixed array.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Integrity failures detected by [`BlockHeader::verify`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    /// Stored hash does not match the header fields.
    #[error("block {height} hash mismatch: stored={stored}, computed={computed}")]
    HashMismatch {
        /// Height of the offending header.
        height: u64,
        /// Hex of the stored hash.
        stored: String,
        /// Hex of the recomputed hash.
        computed: String,
    },

    /// Height-zero header with a non-zero parent.
    #[error("genesis block must have zeroed parent_hash")]
    GenesisParent,
}

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// A block as the fork logic sees it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (genesis = 0).
    pub height: u64,
    /// BLAKE3 hash of this header's fields.
    pub hash: [u8; 32],
    /// Hash of the parent header. All zeros for genesis.
    pub parent_hash: [u8; 32],
    /// Unix timestamp (milliseconds) when the block was produced.
    pub timestamp: u64,
    /// Address of the producer that sealed this block.
    pub producer: String,
    /// Merkle root of the block's transaction hashes.
    pub tx_root: [u8; 32],
}

impl BlockHeader {
    /// Genesis header for a chain identifier.
    ///
    /// Deterministic: every node tracking `chain_id` derives the same hash,
    /// and two identifiers never share a genesis.
    pub fn genesis(chain_id: ChainId) -> Self {
        let producer = format!("genesis:{chain_id}");
        let tx_root = [0u8; 32];
        let hash = compute_header_hash(0, &[0u8; 32], 0, &producer, &tx_root);
        Self {
            height: 0,
            hash,
            parent_hash: [0u8; 32],
            timestamp: 0,
            producer,
            tx_root,
        }
    }

    /// Header extending `parent` with an explicit timestamp.
    pub fn new(
        parent: &BlockHeader,
        timestamp: u64,
        producer: impl Into<String>,
        tx_hashes: &[[u8; 32]],
    ) -> Self {
        let producer = producer.into();
        let height = parent.height + 1;
        let tx_root = compute_merkle_root(tx_hashes);
        let hash = compute_header_hash(height, &parent.hash, timestamp, &producer, &tx_root);
        Self {
            height,
            hash,
            parent_hash: parent.hash,
            timestamp,
            producer,
            tx_root,
        }
    }

    /// Header extending `parent`, stamped with the current wall clock.
    pub fn extend(parent: &BlockHeader, producer: impl Into<String>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::new(parent, timestamp, producer, &[])
    }

    /// Recompute the hash from the header fields.
    pub fn compute_hash(&self) -> [u8; 32] {
        compute_header_hash(
            self.height,
            &self.parent_hash,
            self.timestamp,
            &self.producer,
            &self.tx_root,
        )
    }

    /// Checks hash consistency and the genesis linkage rule.
    pub fn verify(&self) -> Result<(), BlockError> {
        let computed = self.compute_hash();
        if computed != self.hash {
            return Err(BlockError::HashMismatch {
                height: self.height,
                stored: hex::encode(self.hash),
                computed: hex::encode(computed),
            });
        }
        if self.height == 0 && self.parent_hash != [0u8; 32] {
            return Err(BlockError::GenesisParent);
        }
        Ok(())
    }

    /// Whether `self` directly extends `parent`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.parent_hash == parent.hash && self.height == parent.height + 1
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, short_hash(&self.hash))
    }
}

/// First eight hex characters of a hash, for log lines.
pub fn short_hash(hash: &[u8; 32]) -> String {
    hex::encode(&hash[..4])
}

// ---------------------------------------------------------------------------
// Hash Computation
// ---------------------------------------------------------------------------

fn compute_header_hash(
    height: u64,
    parent_hash: &[u8; 32],
    timestamp: u64,
    producer: &str,
    tx_root: &[u8; 32],
) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(96 + producer.len());
    preimage.extend_from_slice(&height.to_le_bytes());
    preimage.extend_from_slice(parent_hash);
    preimage.extend_from_slice(&timestamp.to_le_bytes());
    preimage.extend_from_slice(producer.as_bytes());
    preimage.extend_from_slice(tx_root);
    blake3_hash(&preimage)
}

/// Binary Merkle root over transaction hashes.
///
/// Internal nodes are `BLAKE3(left || right)`; an odd node is paired with
/// itself. An empty list yields all zeros.
pub fn compute_merkle_root(tx_hashes: &[[u8; 32]]) -> [u8; 32] {
    if tx_hashes.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<[u8; 32]> = tx_hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(&pair[0]);
                combined[32..].copy_from_slice(right);
                blake3_hash(&combined)
            })
            .collect();
    }
    level[0]
}
