//! Consensus gate used by the node.
//!
//! The node has no block producer of its own yet, so pausing consensus means
//! recording which chains are paused and logging the transitions. The
//! simulated block feed checks [`TracingGate::is_paused`] before producing.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::{info, warn};

use forkwatch_protocol::config::ChainId;
use forkwatch_protocol::monitor::ConsensusGate;

#[derive(Debug, Default)]
pub struct TracingGate {
    paused: Mutex<BTreeSet<ChainId>>,
}

impl TracingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self, chain_id: ChainId) -> bool {
        self.paused.lock().contains(&chain_id)
    }
}

impl ConsensusGate for TracingGate {
    fn pause(&self, chain_id: ChainId) {
        if !self.paused.lock().insert(chain_id) {
            warn!(chain_id, "consensus paused twice");
        }
        info!(chain_id, "consensus paused for chain switch");
    }

    fn resume(&self, chain_id: ChainId) {
        if !self.paused.lock().remove(&chain_id) {
            warn!(chain_id, "resume without matching pause");
        }
        info!(chain_id, "consensus resumed");
    }
}
