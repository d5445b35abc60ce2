//! # Prometheus Metrics
//!
//! Fork resolution metrics, scraped at `/metrics`. All handles live in a
//! dedicated [`prometheus::Registry`] under the `forkwatch` prefix.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use forkwatch_protocol::monitor::{CleanReport, CycleReport};
use forkwatch_protocol::storage::ChainRegistry;

/// Handles for every metric the node exports.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Fork monitor cycles completed.
    pub monitor_cycles_total: IntCounter,
    /// Successful master chain switches.
    pub chain_switches_total: IntCounter,
    /// Switches abandoned with the master restored.
    pub switch_rollbacks_total: IntCounter,
    /// Per-chain errors and panics caught by either task.
    pub task_failures_total: IntCounter,
    /// Chain visits skipped because the chain was not running.
    pub chains_skipped_total: IntCounter,
    /// Forks evicted by the cleaner.
    pub forks_pruned_total: IntCounter,
    /// Forks currently tracked, across all chains.
    pub tracked_forks: IntGauge,
    /// Master tip height per chain.
    pub master_height: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("forkwatch".into()), None)?;

        let monitor_cycles_total = counter(
            &registry,
            "monitor_cycles_total",
            "Fork monitor cycles completed",
        )?;
        let chain_switches_total = counter(
            &registry,
            "chain_switches_total",
            "Master chain replaced by a fork",
        )?;
        let switch_rollbacks_total = counter(
            &registry,
            "switch_rollbacks_total",
            "Chain switches abandoned and rolled back",
        )?;
        let task_failures_total = counter(
            &registry,
            "task_failures_total",
            "Per-chain errors or panics caught by the monitor or cleaner",
        )?;
        let chains_skipped_total = counter(
            &registry,
            "chains_skipped_total",
            "Chain visits skipped because the chain was not running",
        )?;
        let forks_pruned_total = counter(
            &registry,
            "forks_pruned_total",
            "Fork chains evicted for trailing the master tip",
        )?;

        let tracked_forks = IntGauge::new("tracked_forks", "Fork chains currently tracked")?;
        registry.register(Box::new(tracked_forks.clone()))?;

        let master_height = IntGaugeVec::new(
            Opts::new("master_height", "Tip height of the master chain"),
            &["chain_id"],
        )?;
        registry.register(Box::new(master_height.clone()))?;

        Ok(Self {
            registry,
            monitor_cycles_total,
            chain_switches_total,
            switch_rollbacks_total,
            task_failures_total,
            chains_skipped_total,
            forks_pruned_total,
            tracked_forks,
            master_height,
        })
    }

    pub fn record_cycle(&self, report: &CycleReport) {
        self.monitor_cycles_total.inc();
        self.chain_switches_total.inc_by(report.switched() as u64);
        self.switch_rollbacks_total.inc_by(report.rolled_back() as u64);
        self.task_failures_total.inc_by(report.failed() as u64);
        self.chains_skipped_total.inc_by(report.skipped() as u64);
    }

    pub fn record_clean(&self, report: &CleanReport) {
        self.forks_pruned_total.inc_by(report.total_pruned() as u64);
        self.task_failures_total.inc_by(report.failed() as u64);
    }

    /// Refreshes the gauges from the registry's current contents.
    pub fn observe(&self, registry: &ChainRegistry) {
        let mut forks = 0usize;
        for chain_id in registry.chain_ids() {
            forks += registry.fork_count(chain_id);
            if let Ok(master) = registry.master_chain(chain_id) {
                self.master_height
                    .with_label_values(&[&chain_id.to_string()])
                    .set(master.end_height() as i64);
            }
        }
        self.tracked_forks.set(forks as i64);
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Router serving [`metrics_handler`] at `/metrics`.
pub fn router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}
