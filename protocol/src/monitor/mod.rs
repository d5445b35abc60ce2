//! # Fork Monitors
//!
//! Two periodic tasks walk every chain context in ascending chain id order:
//!
//! ```text
//! ForkChainsMonitor  every 10s   pick the best fork, switch if it leads
//!                                the master by >= chain_switch_threshold
//! ForkChainsCleaner  every 60s   drop forks more than height_range
//!                                blocks behind the master tip
//! ```
//!
//! Each cycle is synchronous and returns a report with one outcome per chain.
//! A chain that errors or panics is recorded as failed and the cycle moves
//! on to the next one. The async `run` loops only add scheduling and
//! shutdown on top of `run_cycle`.

pub mod cleaner;
pub mod fork_chains;
pub mod gate;

use std::any::Any;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::config::{
    ChainId, FORK_CLEANER_INTERVAL_MS, FORK_MONITOR_INTERVAL_MS, OPTIMISTIC_RETRY_LIMIT,
};
use crate::context::RunningStatus;
use crate::storage::registry::{RegistryError, RollbackReason, SwitchError};

pub use cleaner::{CleanOutcome, CleanReport, ForkChainsCleaner};
pub use fork_chains::{select_switch_candidate, ForkChainsMonitor, Selection};
pub use gate::{ConsensusGate, GateNotice, RecordingGate};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduling knobs for [`ForkChainsMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between cycles, in milliseconds.
    pub interval_ms: u64,

    /// Optimistic attempts per chain before the monitor blocks on the
    /// exclusive guard instead.
    pub optimistic_retry_limit: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: FORK_MONITOR_INTERVAL_MS,
            optimistic_retry_limit: OPTIMISTIC_RETRY_LIMIT,
        }
    }
}

/// Scheduling knobs for [`ForkChainsCleaner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    /// Time between cycles, in milliseconds.
    pub interval_ms: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval_ms: FORK_CLEANER_INTERVAL_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors & Reports
// ---------------------------------------------------------------------------

/// Unexpected per-chain failures inside a cycle. Never escapes `run_cycle`.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Switch(#[from] SwitchError),
}

/// What a monitor cycle did with one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Status was not `Running`.
    Skipped { status: RunningStatus },
    /// Fork set was empty.
    NoForks,
    /// Best fork did not lead by enough (zero if none was ahead at all).
    BelowThreshold {
        max_height_difference: u64,
        threshold: u64,
    },
    /// The fork replaced the master.
    Switched {
        fork_point: u64,
        new_tip: u64,
        rolled_back: usize,
        applied: usize,
    },
    /// The switch was attempted and undone; the master is unchanged.
    RolledBack { reason: RollbackReason },
    /// Error or panic; logged at error level.
    Failed { error: String },
}

impl fmt::Display for ChainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped { status } => write!(f, "skipped ({})", status),
            Self::NoForks => write!(f, "no forks"),
            Self::BelowThreshold {
                max_height_difference,
                threshold,
            } => write!(
                f,
                "below threshold ({} < {})",
                max_height_difference, threshold
            ),
            Self::Switched {
                fork_point,
                new_tip,
                ..
            } => write!(f, "switched at {} to tip {}", fork_point, new_tip),
            Self::RolledBack { reason } => write!(f, "rolled back: {}", reason),
            Self::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Outcomes of one [`ForkChainsMonitor::run_cycle`], in chain id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub outcomes: Vec<(ChainId, ChainOutcome)>,
}

impl CycleReport {
    pub(crate) fn push(&mut self, chain_id: ChainId, outcome: ChainOutcome) {
        self.outcomes.push((chain_id, outcome));
    }

    /// Outcome recorded for `chain_id`, if it was visited.
    pub fn outcome(&self, chain_id: ChainId) -> Option<&ChainOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == chain_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn switched(&self) -> usize {
        self.count(|o| matches!(o, ChainOutcome::Switched { .. }))
    }

    pub fn rolled_back(&self) -> usize {
        self.count(|o| matches!(o, ChainOutcome::RolledBack { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ChainOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ChainOutcome::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&ChainOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Calls `cycle` every `interval_ms` until `shutdown` turns `true` or its
/// sender goes away. The first cycle runs immediately.
pub(crate) async fn run_periodic(
    name: &'static str,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: impl FnMut(),
) {
    info!(task = name, interval_ms, "periodic task starting");
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            info!(task = name, "received shutdown signal, exiting cleanly");
            return;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!(task = name, "shutting down during sleep");
                return;
            }
        }

        cycle();
    }
}
