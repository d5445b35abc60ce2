//! Fixtures shared by the unit tests.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::config::ChainId;
use crate::storage::block::BlockHeader;
use crate::storage::executor::{BlockExecutor, ExecutionError, JournalExecutor};

/// `count` blocks on top of `parent`, all from `producer`.
pub(crate) fn grow(parent: &BlockHeader, count: u64, producer: &str) -> Vec<BlockHeader> {
    let mut out: Vec<BlockHeader> = Vec::with_capacity(count as usize);
    for i in 0..count {
        let prev = out.last().unwrap_or(parent);
        let next = BlockHeader::new(prev, 1_000 + i, producer, &[]);
        out.push(next);
    }
    out
}

/// [`JournalExecutor`] that refuses (or panics on) chosen block hashes.
#[derive(Debug, Default)]
pub(crate) struct FaultyExecutor {
    journal: JournalExecutor,
    fail_apply: Mutex<HashSet<[u8; 32]>>,
    fail_rollback: Mutex<HashSet<[u8; 32]>>,
    panic_apply: Mutex<HashSet<[u8; 32]>>,
}

impl FaultyExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn journal(&self) -> &JournalExecutor {
        &self.journal
    }

    pub(crate) fn fail_apply(&self, hash: [u8; 32]) {
        self.fail_apply.lock().insert(hash);
    }

    pub(crate) fn fail_rollback(&self, hash: [u8; 32]) {
        self.fail_rollback.lock().insert(hash);
    }

    pub(crate) fn panic_apply(&self, hash: [u8; 32]) {
        self.panic_apply.lock().insert(hash);
    }
}

impl BlockExecutor for FaultyExecutor {
    fn apply(&self, chain_id: ChainId, block: &BlockHeader) -> Result<(), ExecutionError> {
        if self.panic_apply.lock().contains(&block.hash) {
            panic!("executor crashed applying block {}", block.height);
        }
        if self.fail_apply.lock().contains(&block.hash) {
            return Err(ExecutionError::Rejected {
                height: block.height,
                reason: "injected apply fault".into(),
            });
        }
        self.journal.apply(chain_id, block)
    }

    fn rollback(&self, chain_id: ChainId, block: &BlockHeader) -> Result<(), ExecutionError> {
        if self.fail_rollback.lock().contains(&block.hash) {
            return Err(ExecutionError::Rejected {
                height: block.height,
                reason: "injected rollback fault".into(),
            });
        }
        self.journal.rollback(chain_id, block)
    }
}
