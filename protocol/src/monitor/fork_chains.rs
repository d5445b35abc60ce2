//! # Fork Chains Monitor
//!
//! Decides, once per cycle and per chain identifier, whether a fork has
//! pulled far enough ahead of the master chain to replace it.
//!
//! ## Per-Chain Protocol
//!
//! ```text
//!   status != Running ──────────────────────────────> skip
//!        │
//!        v
//!   ┌─> stamp = try_optimistic_read()
//!   │   forks, master = registry snapshots
//!   ├── validate(stamp) fails
//!   │   no forks / best lead < threshold ─────────────> done
//!   ├── try_convert_to_write(stamp) fails
//!   │        │ (after optimistic_retry_limit failures:
//!   │        │  block on write() and re-evaluate there)
//!   │        v
//!   │   Switching → pause → switch_chain → resume → Running
//!   └───────────── retry ─────────────────
//! ```
//!
//! Readers that only need a glance at the chain set never block, and the
//! expensive exclusive section is entered only when a switch is actually
//! warranted. Status and consensus are restored by drop guards, so a panic
//! inside `switch_chain` still leaves the chain `Running` with consensus
//! resumed and the guard released.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::gate::{ConsensusGate, PausedConsensus};
use super::{
    panic_message, run_periodic, ChainOutcome, CycleReport, MonitorConfig, MonitorError,
};
use crate::config::ChainId;
use crate::context::{ChainContext, ContextManager, RunningStatus, WriteGuard};
use crate::storage::chain::Chain;
use crate::storage::registry::{ChainRegistry, SwitchOutcome};

// ---------------------------------------------------------------------------
// Candidate Selection
// ---------------------------------------------------------------------------

/// Result of [`select_switch_candidate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Fork with the greatest lead over the master, if any is ahead at all.
    pub candidate: Option<Arc<Chain>>,
    /// That fork's `end_height - master.end_height`; zero without a
    /// candidate.
    pub max_height_difference: u64,
}

/// Picks the fork leading the master by the most blocks. On a tie the
/// first fork in `forks` order wins. Forks level with or behind the master
/// are never selected.
pub fn select_switch_candidate(master: &Chain, forks: &[Arc<Chain>]) -> Selection {
    let mut selection = Selection {
        candidate: None,
        max_height_difference: 0,
    };
    for fork in forks {
        let lead = fork.end_height().saturating_sub(master.end_height());
        if lead > selection.max_height_difference {
            selection.max_height_difference = lead;
            selection.candidate = Some(Arc::clone(fork));
        }
    }
    selection
}

struct ForkSet<'a>(&'a [Arc<Chain>]);

impl fmt::Display for ForkSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, chain) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", chain)?;
        }
        f.write_str("]")
    }
}

/// Master and forks read together.
struct ChainView {
    master: Arc<Chain>,
    forks: Vec<Arc<Chain>>,
}

enum Evaluation {
    Done(ChainOutcome),
    Switch(Arc<Chain>),
}

/// Sets `Switching` on creation and `Running` on drop.
struct SwitchingStatus<'a> {
    context: &'a ChainContext,
}

impl<'a> SwitchingStatus<'a> {
    fn enter(context: &'a ChainContext) -> Self {
        context.set_status(RunningStatus::Switching);
        Self { context }
    }
}

impl Drop for SwitchingStatus<'_> {
    fn drop(&mut self) {
        self.context.set_status(RunningStatus::Running);
    }
}

// ---------------------------------------------------------------------------
// ForkChainsMonitor
// ---------------------------------------------------------------------------

/// Periodic fork evaluation and switching across all chain contexts.
pub struct ForkChainsMonitor {
    contexts: Arc<ContextManager>,
    registry: Arc<ChainRegistry>,
    gate: Arc<dyn ConsensusGate>,
    config: MonitorConfig,
}

impl ForkChainsMonitor {
    pub fn new(
        contexts: Arc<ContextManager>,
        registry: Arc<ChainRegistry>,
        gate: Arc<dyn ConsensusGate>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            contexts,
            registry,
            gate,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Runs cycles every `interval_ms` until `shutdown` fires.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.run_with(shutdown, |_| {}).await
    }

    /// Like [`run`](Self::run), handing every cycle's report to `on_cycle`.
    pub async fn run_with(
        &self,
        shutdown: watch::Receiver<bool>,
        mut on_cycle: impl FnMut(&CycleReport),
    ) {
        run_periodic("fork_chains_monitor", self.config.interval_ms, shutdown, || {
            let report = self.run_cycle();
            on_cycle(&report);
        })
        .await;
        info!("fork chains monitor stopped");
    }

    /// One pass over every chain context, ascending by chain id.
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        for context in self.contexts.contexts() {
            let chain_id = context.chain_id();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.process_chain(&context)));
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!(chain_id, error = %e, "fork chain check failed");
                    ChainOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(chain_id, panic = %message, "fork chain check panicked");
                    ChainOutcome::Failed { error: message }
                }
            };
            report.push(chain_id, outcome);
        }
        report
    }

    fn process_chain(&self, context: &ChainContext) -> Result<ChainOutcome, MonitorError> {
        let chain_id = context.chain_id();
        let status = context.status();
        if status != RunningStatus::Running {
            debug!(chain_id, %status, "chain not running, skipping fork check");
            return Ok(ChainOutcome::Skipped { status });
        }

        let threshold = context.parameters().chain_switch_threshold;
        let lock = context.lock();
        let mut failed_attempts = 0u32;

        loop {
            if failed_attempts >= self.config.optimistic_retry_limit {
                debug!(
                    chain_id,
                    failed_attempts, "optimistic reads keep failing, taking exclusive guard"
                );
                let guard = lock.write();
                let view = self.read_view(chain_id)?;
                return match self.evaluate(chain_id, &view, threshold) {
                    Evaluation::Done(outcome) => Ok(outcome),
                    Evaluation::Switch(candidate) => {
                        self.switch(context, &guard, &view.master, &candidate)
                    }
                };
            }

            let Some(stamp) = lock.try_optimistic_read() else {
                failed_attempts += 1;
                std::thread::yield_now();
                continue;
            };

            let view = self.read_view(chain_id);
            if !lock.validate(&stamp) {
                failed_attempts += 1;
                continue;
            }
            let view = view?;

            match self.evaluate(chain_id, &view, threshold) {
                Evaluation::Done(outcome) => return Ok(outcome),
                Evaluation::Switch(candidate) => {
                    let Some(guard) = lock.try_convert_to_write(stamp) else {
                        debug!(chain_id, "chain set changed before escalation, re-reading");
                        failed_attempts += 1;
                        continue;
                    };
                    return self.switch(context, &guard, &view.master, &candidate);
                }
            }
        }
    }

    fn read_view(&self, chain_id: ChainId) -> Result<ChainView, MonitorError> {
        let forks = self.registry.fork_chains(chain_id)?;
        let master = self.registry.master_chain(chain_id)?;
        Ok(ChainView { master, forks })
    }

    fn evaluate(&self, chain_id: ChainId, view: &ChainView, threshold: u64) -> Evaluation {
        if view.forks.is_empty() {
            return Evaluation::Done(ChainOutcome::NoForks);
        }

        debug!(
            chain_id,
            master = %view.master,
            forks = %ForkSet(&view.forks),
            "fork chain snapshot"
        );

        let selection = select_switch_candidate(&view.master, &view.forks);
        debug!(
            chain_id,
            max_height_difference = selection.max_height_difference,
            threshold,
            "best fork lead"
        );

        match selection.candidate {
            Some(candidate) if selection.max_height_difference >= threshold => {
                Evaluation::Switch(candidate)
            }
            _ => Evaluation::Done(ChainOutcome::BelowThreshold {
                max_height_difference: selection.max_height_difference,
                threshold,
            }),
        }
    }

    /// The exclusive section. `guard` is released by the caller after the
    /// status is back to `Running`.
    fn switch(
        &self,
        context: &ChainContext,
        guard: &WriteGuard<'_>,
        master: &Chain,
        candidate: &Chain,
    ) -> Result<ChainOutcome, MonitorError> {
        let chain_id = context.chain_id();
        let _status = SwitchingStatus::enter(context);
        let _paused = PausedConsensus::pause(self.gate.as_ref(), chain_id);

        info!(
            chain_id,
            master = %master,
            candidate = %candidate,
            "switching to fork chain"
        );

        match self.registry.switch_chain(guard, chain_id, master, candidate) {
            Ok(SwitchOutcome::Switched {
                fork_point,
                rolled_back,
                applied,
                new_tip,
            }) => {
                info!(chain_id, fork_point, new_tip, "chain switch succeeded");
                Ok(ChainOutcome::Switched {
                    fork_point,
                    new_tip,
                    rolled_back,
                    applied,
                })
            }
            Ok(SwitchOutcome::RolledBack { reason }) => {
                info!(chain_id, %reason, "chain switch failed, auto rollback succeeded");
                Ok(ChainOutcome::RolledBack { reason })
            }
            Err(e) => {
                error!(chain_id, error = %e, "chain switch failed, auto rollback failed");
                Err(e.into())
            }
        }
    }
}
