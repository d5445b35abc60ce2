//! Contiguous runs of block headers and the ordering used to rank forks.
//!
//! A [`Chain`] is either the master chain of an identifier (starting at
//! genesis) or a fork. Forks hold only their own blocks: the first block's
//! parent lives in the master chain (or in a prefix the fork copied when it
//! branched), which is what [`Chain::fork_point`] relies on.

use std::fmt;

use thiserror::Error;

use super::block::{short_hash, BlockHeader};
use crate::config::ChainId;

/// Structural violations when building or extending a [`Chain`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// A chain needs at least one block.
    #[error("chain must contain at least one block")]
    Empty,

    /// A block does not sit at the height after its predecessor.
    #[error("non-contiguous height: expected {expected}, got {got}")]
    Gap {
        /// Height the next block should have.
        expected: u64,
        /// Height it actually has.
        got: u64,
    },

    /// A block's parent hash does not name its predecessor.
    #[error("block at height {height} does not link to its predecessor")]
    BrokenLink {
        /// Height of the unlinked block.
        height: u64,
    },
}

// ---------------------------------------------------------------------------
// ForkKey
// ---------------------------------------------------------------------------

/// Ordering key of the fork set: tip height ascending, then arrival order.
///
/// Field order matters: the derived `Ord` compares `end_height` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForkKey {
    /// Tip height of the fork.
    pub end_height: u64,
    /// Registry-assigned arrival sequence number.
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// An ordered, contiguous, parent-linked run of block headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    chain_id: ChainId,
    seq: u64,
    blocks: Vec<BlockHeader>,
}

impl Chain {
    /// Builds a chain, checking contiguity and parent linkage.
    pub fn new(chain_id: ChainId, seq: u64, blocks: Vec<BlockHeader>) -> Result<Self, ChainError> {
        if blocks.is_empty() {
            return Err(ChainError::Empty);
        }
        for pair in blocks.windows(2) {
            check_link(&pair[0], &pair[1])?;
        }
        Ok(Self {
            chain_id,
            seq,
            blocks,
        })
    }

    /// One-block chain holding the identifier's genesis header.
    pub fn genesis(chain_id: ChainId, seq: u64) -> Self {
        Self {
            chain_id,
            seq,
            blocks: vec![BlockHeader::genesis(chain_id)],
        }
    }

    /// Chain identifier this chain belongs to.
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Arrival sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Height of the first block.
    pub fn start_height(&self) -> u64 {
        self.blocks[0].height
    }

    /// Height of the tip.
    pub fn end_height(&self) -> u64 {
        self.tip().height
    }

    /// `end_height - start_height`.
    pub fn length(&self) -> u64 {
        self.end_height() - self.start_height()
    }

    /// Every block, lowest height first.
    pub fn blocks(&self) -> &[BlockHeader] {
        &self.blocks
    }

    /// The first block.
    pub fn first(&self) -> &BlockHeader {
        &self.blocks[0]
    }

    /// The tip.
    pub fn tip(&self) -> &BlockHeader {
        // `new` and `genesis` both guarantee at least one block.
        &self.blocks[self.blocks.len() - 1]
    }

    /// Position in the fork set.
    pub fn key(&self) -> ForkKey {
        ForkKey {
            end_height: self.end_height(),
            seq: self.seq,
        }
    }

    /// Header at `height`, if this chain covers it.
    pub fn block_at(&self, height: u64) -> Option<&BlockHeader> {
        let offset = height.checked_sub(self.start_height())?;
        self.blocks.get(usize::try_from(offset).ok()?)
    }

    /// Height of the block with `hash`, searching from the tip.
    pub fn height_of(&self, hash: &[u8; 32]) -> Option<u64> {
        self.blocks
            .iter()
            .rev()
            .find(|b| &b.hash == hash)
            .map(|b| b.height)
    }

    /// Whether a block with `hash` belongs to this chain.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.height_of(hash).is_some()
    }

    /// Blocks strictly above `height`, lowest first.
    pub fn blocks_above(&self, height: u64) -> &[BlockHeader] {
        match height.checked_sub(self.start_height()) {
            Some(offset) => {
                let from = usize::try_from(offset + 1).unwrap_or(usize::MAX);
                self.blocks.get(from..).unwrap_or(&[])
            }
            None => &self.blocks,
        }
    }

    /// Blocks from the start up to and including `height`.
    pub fn blocks_through(&self, height: u64) -> &[BlockHeader] {
        match height.checked_sub(self.start_height()) {
            Some(offset) => {
                let to = usize::try_from(offset + 1)
                    .unwrap_or(usize::MAX)
                    .min(self.blocks.len());
                &self.blocks[..to]
            }
            None => &[],
        }
    }

    /// Appends a block on top of the tip.
    pub fn append(&mut self, block: BlockHeader) -> Result<(), ChainError> {
        check_link(self.tip(), &block)?;
        self.blocks.push(block);
        Ok(())
    }

    /// Highest height at which `self` and `other` share an ancestor.
    ///
    /// Either both chains hold the same block at that height, or one chain
    /// starts right above it and its first block's parent is the other
    /// chain's block there. `None` when the chains are unrelated.
    pub fn fork_point(&self, other: &Chain) -> Option<u64> {
        let lo = self.start_height().max(other.start_height());
        let hi = self.end_height().min(other.end_height());
        if lo <= hi {
            for height in (lo..=hi).rev() {
                if let (Some(a), Some(b)) = (self.block_at(height), other.block_at(height)) {
                    if a.hash == b.hash {
                        return Some(height);
                    }
                }
            }
        }
        parent_link(self, other).or_else(|| parent_link(other, self))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain#{} [{}..={}] tip={} parent={}",
            self.seq,
            self.start_height(),
            self.end_height(),
            short_hash(&self.tip().hash),
            short_hash(&self.first().parent_hash),
        )
    }
}

fn check_link(prev: &BlockHeader, next: &BlockHeader) -> Result<(), ChainError> {
    if next.height != prev.height + 1 {
        return Err(ChainError::Gap {
            expected: prev.height + 1,
            got: next.height,
        });
    }
    if next.parent_hash != prev.hash {
        return Err(ChainError::BrokenLink {
            height: next.height,
        });
    }
    Ok(())
}

/// `Some(upper.start - 1)` when `upper` hangs off `lower` right below its
/// first block.
fn parent_link(lower: &Chain, upper: &Chain) -> Option<u64> {
    let below = upper.start_height().checked_sub(1)?;
    let anchor = lower.block_at(below)?;
    (upper.first().parent_hash == anchor.hash).then_some(below)
}
