//! # Simulated Block Feed
//!
//! Stand-in for the network layer on devnets. Every tick it extends each
//! running chain's master by one block, and now and then starts a rival
//! branch two blocks below the tip that grows twice as fast. The rival soon
//! leads by more than the switch threshold, and the fork monitor picks it up.
//!
//! ```text
//! tick:    0    1    2    3    4    5
//! master:  ──●────●────●────●────●────●
//! rival:        └──●●───●●───●●───●●         (lead grows by one per tick)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use forkwatch_protocol::config::ChainId;
use forkwatch_protocol::context::{ChainContext, ContextManager, RunningStatus};
use forkwatch_protocol::storage::{BlockHeader, ChainRegistry, RegistryError};

use crate::gate::TracingGate;

/// Ticks between rival branches on one chain.
const RIVAL_EVERY: u64 = 12;

/// Ticks after which an unadopted rival is abandoned.
const RIVAL_LIFETIME: u64 = 20;

struct Rival {
    tip: BlockHeader,
    born: u64,
}

pub struct BlockFeed {
    contexts: Arc<ContextManager>,
    registry: Arc<ChainRegistry>,
    gate: Arc<TracingGate>,
    rivals: HashMap<ChainId, Rival>,
    round: u64,
}

impl BlockFeed {
    pub fn new(
        contexts: Arc<ContextManager>,
        registry: Arc<ChainRegistry>,
        gate: Arc<TracingGate>,
    ) -> Self {
        Self {
            contexts,
            registry,
            gate,
            rivals: HashMap::new(),
            round: 0,
        }
    }

    pub async fn run(mut self, interval_ms: u64, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms, "simulated block feed starting");
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("simulated block feed stopped");
                    return;
                }
            }
            self.tick();
        }
    }

    /// Produces one round of blocks on every running, unpaused chain.
    pub fn tick(&mut self) {
        self.round += 1;
        for context in self.contexts.contexts() {
            let chain_id = context.chain_id();
            if context.status() != RunningStatus::Running || self.gate.is_paused(chain_id) {
                continue;
            }
            if let Err(e) = self.produce(&context) {
                warn!(chain_id, error = %e, "simulated block rejected");
            }
        }
    }

    fn produce(&mut self, context: &ChainContext) -> Result<(), RegistryError> {
        let chain_id = context.chain_id();
        let guard = context.lock().write();
        let master = self.registry.master_chain(chain_id)?;

        let next = BlockHeader::extend(master.tip(), "local");
        self.registry.accept_block(&guard, chain_id, next)?;

        if let Some(rival) = self.rivals.get(&chain_id) {
            let adopted = master.contains(&rival.tip.hash);
            if adopted || self.round - rival.born > RIVAL_LIFETIME {
                debug!(chain_id, adopted, "rival branch retired");
                self.rivals.remove(&chain_id);
            }
        }

        match self.rivals.get_mut(&chain_id) {
            Some(rival) => {
                for _ in 0..2 {
                    let block = BlockHeader::extend(&rival.tip, "rival");
                    self.registry.accept_block(&guard, chain_id, block.clone())?;
                    rival.tip = block;
                }
            }
            None if self.round % RIVAL_EVERY == 0 => {
                let base = master.end_height().checked_sub(2).and_then(|h| master.block_at(h));
                if let Some(base) = base {
                    let block = BlockHeader::extend(base, "rival");
                    self.registry.accept_block(&guard, chain_id, block.clone())?;
                    debug!(chain_id, from = base.height, "rival branch started");
                    self.rivals.insert(
                        chain_id,
                        Rival {
                            tip: block,
                            born: self.round,
                        },
                    );
                }
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkwatch_protocol::config::ChainParameters;
    use forkwatch_protocol::monitor::{ConsensusGate, ForkChainsMonitor, MonitorConfig};
    use forkwatch_protocol::storage::JournalExecutor;

    #[test]
    fn feed_grows_master_and_eventually_forces_a_switch() {
        let contexts = Arc::new(ContextManager::new());
        let registry = Arc::new(ChainRegistry::new(Arc::new(JournalExecutor::new())));
        let gate = Arc::new(TracingGate::new());
        contexts
            .activate(&registry, 1, ChainParameters::default())
            .unwrap();
        let monitor = ForkChainsMonitor::new(
            Arc::clone(&contexts),
            Arc::clone(&registry),
            gate.clone(),
            MonitorConfig::default(),
        );
        let mut feed = BlockFeed::new(Arc::clone(&contexts), Arc::clone(&registry), gate);

        let mut switches = 0;
        for _ in 0..(RIVAL_EVERY * 2) {
            feed.tick();
            switches += monitor.run_cycle().switched();
        }

        assert!(registry.master_chain(1).unwrap().end_height() >= RIVAL_EVERY * 2);
        assert!(switches >= 1);
    }

    #[test]
    fn paused_chains_get_no_blocks() {
        let contexts = Arc::new(ContextManager::new());
        let registry = Arc::new(ChainRegistry::new(Arc::new(JournalExecutor::new())));
        let gate = Arc::new(TracingGate::new());
        contexts
            .activate(&registry, 1, ChainParameters::default())
            .unwrap();
        gate.pause(1);

        let mut feed = BlockFeed::new(Arc::clone(&contexts), Arc::clone(&registry), gate);
        feed.tick();
        assert_eq!(registry.master_chain(1).unwrap().end_height(), 0);
    }
}
