//! The consensus pause/resume seam.
//!
//! Block production for a chain must not run while its master is being
//! replaced. The monitor brackets every switch with [`ConsensusGate::pause`]
//! and [`ConsensusGate::resume`]; [`PausedConsensus`] makes the resume
//! unconditional once the pause went out.

use parking_lot::Mutex;

use crate::config::ChainId;

/// Notification sink for the consensus component.
pub trait ConsensusGate: Send + Sync {
    /// Stop producing blocks on `chain_id` until `resume`.
    fn pause(&self, chain_id: ChainId);

    /// Production on `chain_id` may continue.
    fn resume(&self, chain_id: ChainId);
}

/// One call received by a [`RecordingGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateNotice {
    Paused(ChainId),
    Resumed(ChainId),
}

/// Gate that remembers every notice, in order. Useful when nothing
/// downstream needs pausing, and in tests.
#[derive(Debug, Default)]
pub struct RecordingGate {
    notices: Mutex<Vec<GateNotice>>,
}

impl RecordingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notice so far, oldest first.
    pub fn notices(&self) -> Vec<GateNotice> {
        self.notices.lock().clone()
    }

    /// Notices concerning `chain_id`.
    pub fn notices_for(&self, chain_id: ChainId) -> Vec<GateNotice> {
        self.notices
            .lock()
            .iter()
            .copied()
            .filter(|n| matches!(n, GateNotice::Paused(id) | GateNotice::Resumed(id) if *id == chain_id))
            .collect()
    }

    /// Whether some chain was paused and not resumed yet.
    pub fn is_any_paused(&self) -> bool {
        let notices = self.notices.lock();
        let paused = notices
            .iter()
            .filter(|n| matches!(n, GateNotice::Paused(_)))
            .count();
        paused != notices.len() - paused
    }
}

impl ConsensusGate for RecordingGate {
    fn pause(&self, chain_id: ChainId) {
        self.notices.lock().push(GateNotice::Paused(chain_id));
    }

    fn resume(&self, chain_id: ChainId) {
        self.notices.lock().push(GateNotice::Resumed(chain_id));
    }
}

/// Pauses on construction, resumes on drop (including during unwinding).
pub(crate) struct PausedConsensus<'a> {
    gate: &'a dyn ConsensusGate,
    chain_id: ChainId,
}

impl<'a> PausedConsensus<'a> {
    pub(crate) fn pause(gate: &'a dyn ConsensusGate, chain_id: ChainId) -> Self {
        gate.pause(chain_id);
        Self { gate, chain_id }
    }
}

impl Drop for PausedConsensus<'_> {
    fn drop(&mut self) {
        self.gate.resume(self.chain_id);
    }
}
