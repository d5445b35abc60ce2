//! # Chain Registry
//!
//! Owns, per chain identifier, the master chain and the ordered set of fork
//! chains, and performs the one operation that replaces the master: the
//! chain switch.
//!
//! ## Snapshots
//!
//! Chains are stored as `Arc<Chain>`. Readers get cheap clones of the
//! pointers and never see a chain mutate under them; writers copy on write
//! (`Arc::make_mut`) or publish a new `Arc`. The per-entry `RwLock` is held
//! only for the duration of a pointer swap, so `master_chain` and
//! `fork_chains` never wait on a switch in progress. Two separate calls can
//! still observe different generations of the entry; callers pair them with
//! a stamp from the chain's [`StampedLock`](crate::context::StampedLock)
//! and discard the pair if the stamp no longer validates.
//!
//! ## Exclusive Access
//!
//! Every mutator takes a `&WriteGuard` as a witness that the caller holds
//! the chain's context guard exclusively. That is what serializes switches,
//! block intake, and pruning for one identifier. The registry keeps the
//! [`StampedLock`] each chain was registered with and rejects guards taken
//! on any other lock, so a mutation always moves the version that the
//! chain's own optimistic readers validate against.
//!
//! ## Switch Algorithm
//!
//! ```text
//!            fork point
//!                │
//! master:  G ─ … ─ F ─ a1 ─ a2 ─ a3             (abandoned: a1..a3)
//!                   └── c1 ─ c2 ─ c3 ─ c4 ─ c5  (adopted:   c1..c5)
//!
//! 1. roll back a3, a2, a1           (executor, tip first)
//! 2. apply c1 … c5                  (executor, height order)
//! 3. on failure: undo applied c's, re-apply a1..a3, registry untouched
//! 4. on success: master = G..F + c1..c5, fork set gains a1..a3,
//!    loses the candidate
//! ```
//!
//! The registry is only written in step 4, in a single pointer swap, so no
//! reader ever sees a partially switched entry. If the executor panics in
//! steps 1 or 2, the completed steps are undone before the panic continues.
//!
//! ## Retention
//!
//! The master keeps every header back to genesis and the
//! [`JournalExecutor`](super::executor::JournalExecutor) keeps one journal
//! entry per applied block, so memory grows with chain height. Extending a
//! master whose previous snapshot is still held elsewhere copies the whole
//! header vector. Fine for devnets and tests; a long-lived deployment needs
//! a compact anchor below `max_rollback`.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::block::{short_hash, BlockError, BlockHeader};
use super::chain::{Chain, ChainError, ForkKey};
use super::executor::{BlockExecutor, ExecutionError};
use crate::config::{ChainId, ChainParameters};
use crate::context::{StampedLock, WriteGuard};

// ---------------------------------------------------------------------------
// Errors & Outcomes
// ---------------------------------------------------------------------------

/// Failures of registry lookups and block intake.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No entry for this identifier.
    #[error("chain {0} is not tracked")]
    UnknownChain(ChainId),

    /// `init_chain` called twice for the same identifier.
    #[error("chain {0} is already tracked")]
    AlreadyTracked(ChainId),

    /// The block's parent is not in the master or any fork.
    #[error("orphan block {height} on chain {chain_id}: parent {parent} is unknown")]
    Orphan {
        /// Identifier the block was offered to.
        chain_id: ChainId,
        /// Height of the orphan.
        height: u64,
        /// Short hash of the missing parent.
        parent: String,
    },

    /// The header failed its integrity check.
    #[error(transparent)]
    InvalidBlock(#[from] BlockError),

    /// The block would break contiguity or linkage.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The executor refused a master-chain block.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The write guard was not taken on this chain's lock.
    #[error("chain {0}: write guard belongs to another lock")]
    ForeignGuard(ChainId),
}

/// Unexpected switch failures. A switch that is abandoned cleanly is not an
/// error; see [`SwitchOutcome::RolledBack`].
#[derive(Debug, Error)]
pub enum SwitchError {
    /// No entry for this identifier.
    #[error("chain {0} is not tracked")]
    UnknownChain(ChainId),

    /// The write guard was not taken on this chain's lock.
    #[error("chain {0}: write guard belongs to another lock")]
    ForeignGuard(ChainId),

    /// The master passed in is no longer the registry's master.
    #[error("chain {chain_id}: master changed since it was read")]
    StaleMaster {
        /// Identifier being switched.
        chain_id: ChainId,
    },

    /// The candidate is not (or no longer) in the fork set.
    #[error("chain {chain_id}: chain#{seq} is not in the fork set")]
    NotAFork {
        /// Identifier being switched.
        chain_id: ChainId,
        /// Sequence number of the candidate.
        seq: u64,
    },

    /// The candidate shares no ancestor with the master.
    #[error("chain {chain_id}: chain#{seq} shares no ancestor with the master")]
    NoCommonAncestor {
        /// Identifier being switched.
        chain_id: ChainId,
        /// Sequence number of the candidate.
        seq: u64,
    },

    /// A switch failed and putting the master's state back failed too.
    /// The executor's state for this chain can no longer be trusted.
    #[error("chain {chain_id}: auto rollback failed: {source}")]
    RestoreFailed {
        /// Identifier being switched.
        chain_id: ChainId,
        /// Executor failure during restoration.
        #[source]
        source: ExecutionError,
    },

    /// The merged chain could not be assembled.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Why a switch was abandoned with the master left as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    /// The fork diverged deeper than `max_rollback` allows.
    TooDeep {
        /// Blocks that would have been rolled back.
        depth: u64,
        /// Configured ceiling.
        max: u64,
    },
    /// Rolling back a master block failed.
    RollbackFailed {
        /// Height of the block the executor refused to revert.
        height: u64,
        /// Executor error.
        error: ExecutionError,
    },
    /// Applying a candidate block failed.
    ApplyFailed {
        /// Height of the block the executor refused.
        height: u64,
        /// Executor error.
        error: ExecutionError,
    },
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooDeep { depth, max } => {
                write!(f, "rollback depth {} exceeds maximum {}", depth, max)
            }
            Self::RollbackFailed { height, error } => {
                write!(f, "rolling back block {} failed: {}", height, error)
            }
            Self::ApplyFailed { height, error } => {
                write!(f, "applying block {} failed: {}", height, error)
            }
        }
    }
}

/// Result of a switch attempt that left the registry consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The candidate is now the master.
    Switched {
        /// Highest height shared by the old master and the candidate.
        fork_point: u64,
        /// Master blocks rolled back (and demoted into the fork set).
        rolled_back: usize,
        /// Candidate blocks applied.
        applied: usize,
        /// Tip height of the new master.
        new_tip: u64,
    },
    /// The switch was abandoned; master and executor state are unchanged.
    RolledBack {
        /// What stopped it.
        reason: RollbackReason,
    },
}

impl SwitchOutcome {
    /// `true` for [`SwitchOutcome::Switched`].
    pub fn is_switched(&self) -> bool {
        matches!(self, Self::Switched { .. })
    }
}

/// Where [`ChainRegistry::accept_block`] put a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Appended to the master tip (and applied).
    ExtendedMaster {
        /// New master tip height.
        height: u64,
    },
    /// Appended to an existing fork's tip.
    ExtendedFork {
        /// The fork's sequence number.
        seq: u64,
        /// New fork tip height.
        height: u64,
    },
    /// Started a new fork.
    NewFork {
        /// Sequence number of the new fork.
        seq: u64,
        /// Its tip height.
        height: u64,
    },
    /// Already known; nothing changed.
    Duplicate,
}

// ---------------------------------------------------------------------------
// ChainRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ChainEntry {
    lock: Arc<StampedLock>,
    master: Arc<Chain>,
    forks: BTreeMap<ForkKey, Arc<Chain>>,
    max_rollback: u64,
    max_fork_chains: usize,
}

/// Master and fork chains for every tracked identifier.
pub struct ChainRegistry {
    entries: DashMap<ChainId, Arc<RwLock<ChainEntry>>>,
    executor: Arc<dyn BlockExecutor>,
    next_seq: AtomicU64,
}

impl fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("chains", &self.entries.len())
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChainRegistry {
    /// Creates an empty registry driving `executor`.
    pub fn new(executor: Arc<dyn BlockExecutor>) -> Self {
        Self {
            entries: DashMap::new(),
            executor,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Starts tracking `chain_id` with a genesis-only master. The genesis
    /// block is applied to the executor. Mutators will only accept write
    /// guards taken on `lock`.
    pub fn init_chain(
        &self,
        chain_id: ChainId,
        parameters: &ChainParameters,
        lock: Arc<StampedLock>,
    ) -> Result<(), RegistryError> {
        match self.entries.entry(chain_id) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyTracked(chain_id)),
            Entry::Vacant(slot) => {
                let master = Chain::genesis(chain_id, self.next_seq());
                self.executor.apply(chain_id, master.tip())?;
                slot.insert(Arc::new(RwLock::new(ChainEntry {
                    lock,
                    master: Arc::new(master),
                    forks: BTreeMap::new(),
                    max_rollback: parameters.max_rollback,
                    max_fork_chains: parameters.max_fork_chains,
                })));
                Ok(())
            }
        }
    }

    /// Stops tracking `chain_id`, returning its last master.
    pub fn remove_chain(&self, chain_id: ChainId) -> Option<Arc<Chain>> {
        self.entries
            .remove(&chain_id)
            .map(|(_, entry)| Arc::clone(&entry.read().master))
    }

    /// Tracked identifiers, ascending.
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<_> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Current master of `chain_id`.
    pub fn master_chain(&self, chain_id: ChainId) -> Result<Arc<Chain>, RegistryError> {
        let entry = self.entry(chain_id).ok_or(RegistryError::UnknownChain(chain_id))?;
        let master = Arc::clone(&entry.read().master);
        Ok(master)
    }

    /// Current forks of `chain_id`, in fork-set order.
    pub fn fork_chains(&self, chain_id: ChainId) -> Result<Vec<Arc<Chain>>, RegistryError> {
        let entry = self.entry(chain_id).ok_or(RegistryError::UnknownChain(chain_id))?;
        let forks = entry.read().forks.values().cloned().collect();
        Ok(forks)
    }

    /// Number of forks tracked for `chain_id` (zero if untracked).
    pub fn fork_count(&self, chain_id: ChainId) -> usize {
        self.entry(chain_id)
            .map(|entry| entry.read().forks.len())
            .unwrap_or(0)
    }

    /// Files an incoming block under the master or a fork.
    ///
    /// - extends the master tip: applied through the executor and appended;
    /// - extends a fork tip: appended to that fork;
    /// - has its parent anywhere else: starts a new fork. A branch off a
    ///   fork copies the fork's prefix so the new fork hangs off the master
    ///   on its own.
    ///
    /// When the fork set is full, the lowest fork (shortest, then oldest)
    /// is evicted to make room.
    pub fn accept_block(
        &self,
        exclusive: &WriteGuard<'_>,
        chain_id: ChainId,
        block: BlockHeader,
    ) -> Result<Placement, RegistryError> {
        block.verify()?;
        let entry = self.guarded_entry(exclusive, chain_id)?;
        let mut state = entry.write();

        if state.master.contains(&block.hash) || state.forks.values().any(|f| f.contains(&block.hash))
        {
            return Ok(Placement::Duplicate);
        }

        if block.extends(state.master.tip()) {
            self.executor.apply(chain_id, &block)?;
            let height = block.height;
            Arc::make_mut(&mut state.master).append(block)?;
            debug!(chain_id, height, "master chain extended");
            return Ok(Placement::ExtendedMaster { height });
        }

        let extended = state
            .forks
            .iter()
            .find(|(_, fork)| block.extends(fork.tip()))
            .map(|(key, fork)| (*key, Arc::clone(fork)));
        if let Some((key, fork)) = extended {
            let mut grown = (*fork).clone();
            grown.append(block)?;
            let placement = Placement::ExtendedFork {
                seq: grown.seq(),
                height: grown.end_height(),
            };
            state.forks.remove(&key);
            state.forks.insert(grown.key(), Arc::new(grown));
            return Ok(placement);
        }

        let mut blocks = branch_prefix(&state, &block).ok_or_else(|| RegistryError::Orphan {
            chain_id,
            height: block.height,
            parent: short_hash(&block.parent_hash),
        })??;
        blocks.push(block);
        let fork = Chain::new(chain_id, self.next_seq(), blocks)?;

        if state.forks.len() >= state.max_fork_chains {
            if let Some((evicted, _)) = state.forks.pop_first() {
                warn!(
                    chain_id,
                    evicted_seq = evicted.seq,
                    evicted_height = evicted.end_height,
                    "fork set full, evicted lowest fork"
                );
            }
        }

        let placement = Placement::NewFork {
            seq: fork.seq(),
            height: fork.end_height(),
        };
        debug!(chain_id, fork = %fork, "new fork chain");
        state.forks.insert(fork.key(), Arc::new(fork));
        Ok(placement)
    }

    /// Replaces the master of `chain_id` with `candidate`, all or nothing.
    ///
    /// `old_master` must be the registry's current master and `candidate`
    /// a member of its fork set, both as read by the caller before it
    /// escalated to exclusive access.
    pub fn switch_chain(
        &self,
        exclusive: &WriteGuard<'_>,
        chain_id: ChainId,
        old_master: &Chain,
        candidate: &Chain,
    ) -> Result<SwitchOutcome, SwitchError> {
        let entry = self
            .guarded_entry(exclusive, chain_id)
            .map_err(|e| match e {
                RegistryError::ForeignGuard(id) => SwitchError::ForeignGuard(id),
                _ => SwitchError::UnknownChain(chain_id),
            })?;

        let max_rollback = {
            let state = entry.read();
            if !same_chain(&state.master, old_master) {
                return Err(SwitchError::StaleMaster { chain_id });
            }
            match state.forks.get(&candidate.key()) {
                Some(fork) if same_chain(fork, candidate) => {}
                _ => {
                    return Err(SwitchError::NotAFork {
                        chain_id,
                        seq: candidate.seq(),
                    })
                }
            }
            state.max_rollback
        };

        let fork_point = old_master
            .fork_point(candidate)
            .filter(|height| *height >= old_master.start_height())
            .ok_or(SwitchError::NoCommonAncestor {
                chain_id,
                seq: candidate.seq(),
            })?;

        let depth = old_master.end_height() - fork_point;
        if depth > max_rollback {
            warn!(chain_id, depth, max_rollback, "fork diverges too deep to switch");
            return Ok(SwitchOutcome::RolledBack {
                reason: RollbackReason::TooDeep {
                    depth,
                    max: max_rollback,
                },
            });
        }

        let abandoned = old_master.blocks_above(fork_point);
        let adopted = candidate.blocks_above(fork_point);

        // Assemble the post-switch chains before the executor is touched.
        let mut merged = old_master.blocks_through(fork_point).to_vec();
        merged.extend_from_slice(adopted);
        let new_master = Chain::new(chain_id, old_master.seq(), merged)?;
        let demoted = if abandoned.is_empty() {
            None
        } else {
            Some(Chain::new(chain_id, self.next_seq(), abandoned.to_vec())?)
        };

        debug!(
            chain_id,
            fork_point,
            rollback = abandoned.len(),
            apply = adopted.len(),
            "switching master chain"
        );

        if let Some(reason) = self.replay(chain_id, abandoned, adopted)? {
            return Ok(SwitchOutcome::RolledBack { reason });
        }

        let mut state = entry.write();
        state.forks.remove(&candidate.key());
        if let Some(demoted) = demoted {
            rebase_forks(&mut state.forks, &new_master, &demoted);
            state.forks.insert(demoted.key(), Arc::new(demoted));
        }
        let new_tip = new_master.end_height();
        state.master = Arc::new(new_master);

        info!(
            chain_id,
            fork_point,
            new_tip,
            tip = %short_hash(&state.master.tip().hash),
            "master chain replaced"
        );

        Ok(SwitchOutcome::Switched {
            fork_point,
            rolled_back: abandoned.len(),
            applied: adopted.len(),
            new_tip,
        })
    }

    /// Evicts forks whose tip trails the master tip by more than
    /// `height_range`. Returns how many were dropped.
    pub fn prune_forks(
        &self,
        exclusive: &WriteGuard<'_>,
        chain_id: ChainId,
        height_range: u64,
    ) -> Result<usize, RegistryError> {
        let entry = self.guarded_entry(exclusive, chain_id)?;
        let mut state = entry.write();
        let master_end = state.master.end_height();
        let before = state.forks.len();
        state
            .forks
            .retain(|key, _| key.end_height.saturating_add(height_range) >= master_end);
        Ok(before - state.forks.len())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn entry(&self, chain_id: ChainId) -> Option<Arc<RwLock<ChainEntry>>> {
        self.entries.get(&chain_id).map(|e| Arc::clone(e.value()))
    }

    /// The entry for `chain_id`, provided `exclusive` was taken on the lock
    /// the chain was registered with.
    fn guarded_entry(
        &self,
        exclusive: &WriteGuard<'_>,
        chain_id: ChainId,
    ) -> Result<Arc<RwLock<ChainEntry>>, RegistryError> {
        let entry = self.entry(chain_id).ok_or(RegistryError::UnknownChain(chain_id))?;
        if !exclusive.guards(&entry.read().lock) {
            return Err(RegistryError::ForeignGuard(chain_id));
        }
        Ok(entry)
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Walks the executor from the old master onto the candidate. Returns
    /// `Some(reason)` when it had to walk back, with the executor restored.
    ///
    /// A panic from the executor is caught long enough to undo the steps
    /// that already completed, then resumed.
    fn replay(
        &self,
        chain_id: ChainId,
        abandoned: &[BlockHeader],
        adopted: &[BlockHeader],
    ) -> Result<Option<RollbackReason>, SwitchError> {
        let mut progress = Progress::default();
        let walked = panic::catch_unwind(AssertUnwindSafe(|| {
            self.walk(chain_id, abandoned, adopted, &mut progress)
        }));
        let payload = match walked {
            Ok(result) => return result,
            Err(payload) => payload,
        };

        if progress.restoring {
            error!(chain_id, "executor panicked while restoring the master");
        } else {
            let undo = &adopted[..progress.applied];
            let redo = &abandoned[abandoned.len() - progress.rolled_back..];
            match self.restore(chain_id, undo, redo) {
                Ok(()) => warn!(
                    chain_id,
                    rolled_back = progress.rolled_back,
                    applied = progress.applied,
                    "executor panicked mid-switch, master state restored"
                ),
                Err(e) => error!(
                    chain_id,
                    error = %e,
                    "executor panicked mid-switch, restoring the master failed"
                ),
            }
        }
        panic::resume_unwind(payload)
    }

    fn walk(
        &self,
        chain_id: ChainId,
        abandoned: &[BlockHeader],
        adopted: &[BlockHeader],
        progress: &mut Progress,
    ) -> Result<Option<RollbackReason>, SwitchError> {
        for block in abandoned.iter().rev() {
            if let Err(error) = self.executor.rollback(chain_id, block) {
                progress.restoring = true;
                let reverted = &abandoned[abandoned.len() - progress.rolled_back..];
                self.restore(chain_id, &[], reverted)?;
                return Ok(Some(RollbackReason::RollbackFailed {
                    height: block.height,
                    error,
                }));
            }
            progress.rolled_back += 1;
        }

        for block in adopted {
            if let Err(error) = self.executor.apply(chain_id, block) {
                progress.restoring = true;
                self.restore(chain_id, &adopted[..progress.applied], abandoned)?;
                return Ok(Some(RollbackReason::ApplyFailed {
                    height: block.height,
                    error,
                }));
            }
            progress.applied += 1;
        }

        Ok(None)
    }

    /// Reverts `undo` (tip first), then re-applies `redo` in height order.
    fn restore(
        &self,
        chain_id: ChainId,
        undo: &[BlockHeader],
        redo: &[BlockHeader],
    ) -> Result<(), SwitchError> {
        let restore_failed = |source| SwitchError::RestoreFailed { chain_id, source };
        for block in undo.iter().rev() {
            self.executor.rollback(chain_id, block).map_err(restore_failed)?;
        }
        for block in redo {
            self.executor.apply(chain_id, block).map_err(restore_failed)?;
        }
        Ok(())
    }
}

/// Executor steps completed during a replay.
#[derive(Debug, Default)]
struct Progress {
    rolled_back: usize,
    applied: usize,
    restoring: bool,
}

fn same_chain(a: &Chain, b: &Chain) -> bool {
    a.seq() == b.seq() && a.start_height() == b.start_height() && a.tip().hash == b.tip().hash
}

/// Blocks a new fork must carry below `block`, or `None` if its parent is
/// unknown. A branch off the master needs no prefix.
fn branch_prefix(
    state: &ChainEntry,
    block: &BlockHeader,
) -> Option<Result<Vec<BlockHeader>, ChainError>> {
    let check_height = |parent_height: u64| {
        if block.height == parent_height + 1 {
            Ok(())
        } else {
            Err(ChainError::Gap {
                expected: parent_height + 1,
                got: block.height,
            })
        }
    };

    if let Some(height) = state.master.height_of(&block.parent_hash) {
        return Some(check_height(height).map(|_| Vec::new()));
    }
    state.forks.values().find_map(|fork| {
        fork.height_of(&block.parent_hash).map(|height| {
            check_height(height).map(|_| fork.blocks_through(height).to_vec())
        })
    })
}

/// Re-anchors forks that hung off the demoted segment so they stay linked
/// to the new master. Forks that cannot be re-anchored are dropped.
fn rebase_forks(forks: &mut BTreeMap<ForkKey, Arc<Chain>>, new_master: &Chain, demoted: &Chain) {
    let unlinked: Vec<ForkKey> = forks
        .iter()
        .filter(|(_, fork)| new_master.fork_point(fork).is_none())
        .map(|(key, _)| *key)
        .collect();

    for key in unlinked {
        let Some(fork) = forks.remove(&key) else {
            continue;
        };
        let Some(anchor) = demoted.height_of(&fork.first().parent_hash) else {
            warn!(fork = %fork, "dropping fork with no link to the new master");
            continue;
        };
        let mut blocks = demoted.blocks_through(anchor).to_vec();
        blocks.extend_from_slice(fork.blocks());
        match Chain::new(fork.chain_id(), fork.seq(), blocks) {
            Ok(rebased) => {
                forks.insert(rebased.key(), Arc::new(rebased));
            }
            Err(e) => warn!(fork = %fork, error = %e, "dropping fork that failed to rebase"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StampedLock;
    use crate::testing::{grow, FaultyExecutor};

    struct Fixture {
        registry: ChainRegistry,
        executor: Arc<FaultyExecutor>,
        lock: Arc<StampedLock>,
    }

    const CHAIN: ChainId = 1;

    fn fixture(params: ChainParameters) -> Fixture {
        let executor = Arc::new(FaultyExecutor::new());
        let registry = ChainRegistry::new(executor.clone());
        let lock = Arc::new(StampedLock::new());
        registry.init_chain(CHAIN, &params, Arc::clone(&lock)).unwrap();
        Fixture {
            registry,
            executor,
            lock,
        }
    }

    impl Fixture {
        fn accept_all(&self, blocks: &[BlockHeader]) {
            let guard = self.lock.write();
            for block in blocks {
                self.registry
                    .accept_block(&guard, CHAIN, block.clone())
                    .unwrap();
            }
        }

        /// Master of height `len`, returned for building forks on it.
        fn master_of(&self, len: u64) -> Arc<Chain> {
            let genesis = self.registry.master_chain(CHAIN).unwrap();
            self.accept_all(&grow(genesis.tip(), len, "main"));
            self.registry.master_chain(CHAIN).unwrap()
        }

        fn switch(&self, candidate: &Chain) -> Result<SwitchOutcome, SwitchError> {
            let master = self.registry.master_chain(CHAIN).unwrap();
            let guard = self.lock.write();
            self.registry.switch_chain(&guard, CHAIN, &master, candidate)
        }

        fn only_fork(&self) -> Arc<Chain> {
            let forks = self.registry.fork_chains(CHAIN).unwrap();
            assert_eq!(forks.len(), 1);
            Arc::clone(&forks[0])
        }
    }

    #[test]
    fn init_twice_rejected() {
        let f = fixture(ChainParameters::default());
        let err = f
            .registry
            .init_chain(CHAIN, &ChainParameters::default(), Arc::clone(&f.lock))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyTracked(CHAIN)));
    }

    #[test]
    fn unknown_chain_lookups_fail() {
        let f = fixture(ChainParameters::default());
        assert!(matches!(
            f.registry.master_chain(99),
            Err(RegistryError::UnknownChain(99))
        ));
        assert!(f.registry.fork_chains(99).is_err());
        assert_eq!(f.registry.fork_count(99), 0);
    }

    #[test]
    fn blocks_on_master_tip_are_applied() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(5);
        assert_eq!(master.end_height(), 5);
        assert_eq!(f.executor.journal().depth(CHAIN), 6);
        assert_eq!(f.executor.journal().tip(CHAIN), Some(master.tip().hash));
    }

    #[test]
    fn branch_off_master_starts_fork() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(5);
        f.accept_all(&grow(master.block_at(3).unwrap(), 4, "fork"));

        let fork = f.only_fork();
        assert_eq!(fork.start_height(), 4);
        assert_eq!(fork.end_height(), 7);
        assert_eq!(master.fork_point(&fork), Some(3));
        // Fork blocks are never applied.
        assert_eq!(f.executor.journal().depth(CHAIN), 6);
    }

    #[test]
    fn branch_off_fork_copies_prefix() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(5);
        let fork_blocks = grow(master.block_at(2).unwrap(), 4, "fork-a");
        f.accept_all(&fork_blocks);
        f.accept_all(&grow(&fork_blocks[1], 1, "fork-b"));

        let forks = f.registry.fork_chains(CHAIN).unwrap();
        assert_eq!(forks.len(), 2);
        let branch = forks.iter().find(|c| c.end_height() == 5).unwrap();
        assert_eq!(branch.start_height(), 3);
        assert_eq!(master.fork_point(branch), Some(2));
    }

    #[test]
    fn duplicate_and_orphan_blocks() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(3);
        let guard = f.lock.write();

        let known = master.block_at(2).unwrap().clone();
        assert_eq!(
            f.registry.accept_block(&guard, CHAIN, known).unwrap(),
            Placement::Duplicate
        );

        let stranger = grow(&BlockHeader::genesis(42), 2, "x");
        let err = f
            .registry
            .accept_block(&guard, CHAIN, stranger[1].clone())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Orphan { height: 2, .. }));
    }

    #[test]
    fn full_fork_set_evicts_lowest() {
        let f = fixture(ChainParameters {
            max_fork_chains: 2,
            ..ChainParameters::default()
        });
        let master = f.master_of(6);
        f.accept_all(&grow(master.block_at(1).unwrap(), 1, "low"));
        f.accept_all(&grow(master.block_at(2).unwrap(), 5, "mid"));
        f.accept_all(&grow(master.block_at(3).unwrap(), 6, "high"));

        let heights: Vec<_> = f
            .registry
            .fork_chains(CHAIN)
            .unwrap()
            .iter()
            .map(|c| c.end_height())
            .collect();
        assert_eq!(heights, vec![7, 9]);
    }

    #[test]
    fn switch_adopts_candidate_and_demotes_old_master() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(10);
        f.accept_all(&grow(master.block_at(6).unwrap(), 8, "fork"));
        let candidate = f.only_fork();

        let outcome = f.switch(&candidate).unwrap();
        assert_eq!(
            outcome,
            SwitchOutcome::Switched {
                fork_point: 6,
                rolled_back: 4,
                applied: 8,
                new_tip: 14,
            }
        );

        let new_master = f.registry.master_chain(CHAIN).unwrap();
        assert_eq!(new_master.tip(), candidate.tip());
        assert_eq!(new_master.blocks_above(6), candidate.blocks());
        assert_eq!(new_master.blocks_through(6), master.blocks_through(6));
        assert_eq!(f.executor.journal().tip(CHAIN), Some(candidate.tip().hash));

        let demoted = f.only_fork();
        assert_eq!(demoted.blocks(), master.blocks_above(6));
    }

    #[test]
    fn failed_apply_leaves_master_and_state_untouched() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(10);
        let fork_blocks = grow(master.block_at(6).unwrap(), 8, "fork");
        f.accept_all(&fork_blocks);
        let candidate = f.only_fork();
        let root_before = f.executor.journal().state_root(CHAIN);

        f.executor.fail_apply(fork_blocks[5].hash);
        let outcome = f.switch(&candidate).unwrap();
        assert!(matches!(
            outcome,
            SwitchOutcome::RolledBack {
                reason: RollbackReason::ApplyFailed { height: 12, .. }
            }
        ));

        assert_eq!(*f.registry.master_chain(CHAIN).unwrap(), *master);
        assert_eq!(*f.only_fork(), *candidate);
        assert_eq!(f.executor.journal().state_root(CHAIN), root_before);
    }

    #[test]
    fn failed_rollback_reapplies_what_was_undone() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(10);
        f.accept_all(&grow(master.block_at(5).unwrap(), 9, "fork"));
        let candidate = f.only_fork();
        let root_before = f.executor.journal().state_root(CHAIN);

        f.executor.fail_rollback(master.block_at(7).unwrap().hash);
        let outcome = f.switch(&candidate).unwrap();
        assert!(matches!(
            outcome,
            SwitchOutcome::RolledBack {
                reason: RollbackReason::RollbackFailed { height: 7, .. }
            }
        ));
        assert_eq!(*f.registry.master_chain(CHAIN).unwrap(), *master);
        assert_eq!(f.executor.journal().state_root(CHAIN), root_before);
    }

    #[test]
    fn failed_restore_is_an_error() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(10);
        let fork_blocks = grow(master.block_at(6).unwrap(), 8, "fork");
        f.accept_all(&fork_blocks);
        let candidate = f.only_fork();

        f.executor.fail_apply(fork_blocks[2].hash);
        f.executor.fail_apply(master.block_at(8).unwrap().hash);
        let err = f.switch(&candidate).unwrap_err();
        assert!(matches!(err, SwitchError::RestoreFailed { chain_id: CHAIN, .. }));
    }

    #[test]
    fn executor_panic_mid_switch_restores_master_state() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(10);
        let fork_blocks = grow(master.block_at(6).unwrap(), 8, "fork");
        f.accept_all(&fork_blocks);
        let candidate = f.only_fork();
        let root_before = f.executor.journal().state_root(CHAIN);

        f.executor.panic_apply(fork_blocks[2].hash);
        let crashed = panic::catch_unwind(AssertUnwindSafe(|| f.switch(&candidate)));
        assert!(crashed.is_err());

        assert_eq!(*f.registry.master_chain(CHAIN).unwrap(), *master);
        assert_eq!(f.executor.journal().tip(CHAIN), Some(master.tip().hash));
        assert_eq!(f.executor.journal().state_root(CHAIN), root_before);
        assert!(!f.lock.is_write_locked());

        // The master keeps growing after the crash.
        let next = grow(master.tip(), 1, "main");
        let guard = f.lock.write();
        assert_eq!(
            f.registry.accept_block(&guard, CHAIN, next[0].clone()).unwrap(),
            Placement::ExtendedMaster { height: 11 }
        );
    }

    #[test]
    fn guard_from_another_lock_is_refused() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(4);
        f.accept_all(&grow(master.block_at(2).unwrap(), 5, "fork"));
        let candidate = f.only_fork();
        let stranger = StampedLock::new();
        let guard = stranger.write();

        let next = grow(master.tip(), 1, "main");
        assert!(matches!(
            f.registry.accept_block(&guard, CHAIN, next[0].clone()),
            Err(RegistryError::ForeignGuard(CHAIN))
        ));
        assert!(matches!(
            f.registry.switch_chain(&guard, CHAIN, &master, &candidate),
            Err(SwitchError::ForeignGuard(CHAIN))
        ));
        assert!(matches!(
            f.registry.prune_forks(&guard, CHAIN, 0),
            Err(RegistryError::ForeignGuard(CHAIN))
        ));
        assert_eq!(*f.registry.master_chain(CHAIN).unwrap(), *master);
        assert_eq!(f.registry.fork_count(CHAIN), 1);
    }

    #[test]
    fn too_deep_fork_is_refused() {
        let f = fixture(ChainParameters {
            max_rollback: 3,
            chain_switch_threshold: 1,
            height_range: 10,
            ..ChainParameters::default()
        });
        let master = f.master_of(10);
        f.accept_all(&grow(master.block_at(5).unwrap(), 9, "fork"));
        let candidate = f.only_fork();
        let depth_before = f.executor.journal().depth(CHAIN);

        let outcome = f.switch(&candidate).unwrap();
        assert_eq!(
            outcome,
            SwitchOutcome::RolledBack {
                reason: RollbackReason::TooDeep { depth: 5, max: 3 }
            }
        );
        assert_eq!(f.executor.journal().depth(CHAIN), depth_before);
    }

    #[test]
    fn stale_master_rejected() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(4);
        f.accept_all(&grow(master.block_at(2).unwrap(), 5, "fork"));
        let candidate = f.only_fork();
        f.accept_all(&grow(master.tip(), 1, "main"));

        let guard = f.lock.write();
        let err = f
            .registry
            .switch_chain(&guard, CHAIN, &master, &candidate)
            .unwrap_err();
        assert!(matches!(err, SwitchError::StaleMaster { chain_id: CHAIN }));
    }

    #[test]
    fn candidate_must_be_in_fork_set() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(4);
        let outsider = Chain::new(CHAIN, 777, grow(master.block_at(2).unwrap(), 5, "x")).unwrap();
        let err = f.switch(&outsider).unwrap_err();
        assert!(matches!(err, SwitchError::NotAFork { seq: 777, .. }));
    }

    #[test]
    fn forks_off_the_demoted_segment_are_rebased() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(10);
        f.accept_all(&grow(master.block_at(4).unwrap(), 10, "winner"));
        // Branches off a master block that the switch will abandon.
        f.accept_all(&grow(master.block_at(8).unwrap(), 3, "side"));

        let candidate = f
            .registry
            .fork_chains(CHAIN)
            .unwrap()
            .into_iter()
            .find(|c| c.end_height() == 14)
            .unwrap();
        assert!(f.switch(&candidate).unwrap().is_switched());

        let new_master = f.registry.master_chain(CHAIN).unwrap();
        let forks = f.registry.fork_chains(CHAIN).unwrap();
        assert_eq!(forks.len(), 2);
        for fork in &forks {
            assert_eq!(new_master.fork_point(fork), Some(4), "fork {fork} lost its anchor");
        }
        let side = forks.iter().find(|c| c.end_height() == 11).unwrap();
        assert_eq!(side.start_height(), 5);
        assert_eq!(side.block_at(8), master.block_at(8));
    }

    #[test]
    fn prune_drops_forks_far_behind() {
        let f = fixture(ChainParameters::default());
        let master = f.master_of(30);
        f.accept_all(&grow(master.block_at(2).unwrap(), 2, "stale"));
        f.accept_all(&grow(master.block_at(25).unwrap(), 2, "fresh"));

        let guard = f.lock.write();
        assert_eq!(f.registry.prune_forks(&guard, CHAIN, 10).unwrap(), 1);
        drop(guard);
        assert_eq!(f.only_fork().end_height(), 27);
    }
}
