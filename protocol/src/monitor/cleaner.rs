//! Periodic eviction of forks that fell too far behind.
//!
//! A fork whose tip trails the master tip by more than the chain's
//! `height_range` will not catch up, and keeping it only slows the
//! monitor's snapshot. The cleaner takes each running chain's guard
//! exclusively (pruning changes the fork set, so optimistic readers must
//! notice) and hands the range to [`ChainRegistry::prune_forks`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{panic_message, run_periodic, CleanerConfig};
use crate::config::ChainId;
use crate::context::{ChainContext, ContextManager, RunningStatus};
use crate::storage::registry::{ChainRegistry, RegistryError};

/// What a cleaner cycle did with one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    Skipped { status: RunningStatus },
    Pruned(usize),
    Failed { error: String },
}

/// Outcomes of one [`ForkChainsCleaner::run_cycle`], in chain id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub outcomes: Vec<(ChainId, CleanOutcome)>,
}

impl CleanReport {
    /// Forks evicted across all chains.
    pub fn total_pruned(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                CleanOutcome::Pruned(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CleanOutcome::Failed { .. }))
            .count()
    }
}

/// See the module documentation.
pub struct ForkChainsCleaner {
    contexts: Arc<ContextManager>,
    registry: Arc<ChainRegistry>,
    config: CleanerConfig,
}

impl ForkChainsCleaner {
    pub fn new(
        contexts: Arc<ContextManager>,
        registry: Arc<ChainRegistry>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            contexts,
            registry,
            config,
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.run_with(shutdown, |_| {}).await
    }

    /// Runs cycles until `shutdown` fires, handing each report to `on_cycle`.
    pub async fn run_with(
        &self,
        shutdown: watch::Receiver<bool>,
        mut on_cycle: impl FnMut(&CleanReport),
    ) {
        run_periodic("fork_chains_cleaner", self.config.interval_ms, shutdown, || {
            let report = self.run_cycle();
            on_cycle(&report);
        })
        .await;
        info!("fork chains cleaner stopped");
    }

    pub fn run_cycle(&self) -> CleanReport {
        let mut report = CleanReport::default();
        for context in self.contexts.contexts() {
            let chain_id = context.chain_id();
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.clean_chain(&context)));
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!(chain_id, error = %e, "fork chain cleanup failed");
                    CleanOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(chain_id, panic = %message, "fork chain cleanup panicked");
                    CleanOutcome::Failed { error: message }
                }
            };
            report.outcomes.push((chain_id, outcome));
        }
        report
    }

    fn clean_chain(&self, context: &ChainContext) -> Result<CleanOutcome, RegistryError> {
        let chain_id = context.chain_id();
        let status = context.status();
        if status != RunningStatus::Running {
            debug!(chain_id, %status, "chain not running, skipping cleanup");
            return Ok(CleanOutcome::Skipped { status });
        }

        let height_range = context.parameters().height_range;
        let guard = context.lock().write();
        let pruned = self.registry.prune_forks(&guard, chain_id, height_range)?;
        drop(guard);

        if pruned > 0 {
            info!(chain_id, pruned, height_range, "pruned stale fork chains");
        }
        Ok(CleanOutcome::Pruned(pruned))
    }
}
