//! # Per-Chain Runtime Context
//!
//! One [`ChainContext`] exists for every active chain identifier. It carries
//! the chain's running status, the [`StampedLock`] that guards the chain's
//! master/fork references in the registry, and its [`ChainParameters`].
//!
//! [`ContextManager`] is the provider the monitors iterate. It is built
//! explicitly at node startup and passed around behind an `Arc`; there is no
//! process-global instance.
//!
//! ## Status Transitions
//!
//! ```text
//! Initializing ──activate──> Running ──(monitor, exclusive)──> Switching
//!                               ^                                  │
//!                               └──────────── always ──────────────┘
//! ```
//!
//! `Syncing` belongs to other subsystems. Every state except `Running` makes
//! the monitors skip the chain.

pub mod stamped;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{ChainId, ChainParameters, ConfigError};
use crate::storage::registry::{ChainRegistry, RegistryError};

pub use stamped::{ReadStamp, StampedLock, WriteGuard};

/// Lifecycle state of one chain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningStatus {
    /// Registered but not yet serving.
    Initializing,
    /// Normal operation; the only state the monitors act in.
    Running,
    /// A chain switch is in progress. Never outlives one monitor cycle.
    Switching,
    /// Catching up with peers.
    Syncing,
}

impl fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Switching => "switching",
            Self::Syncing => "syncing",
        };
        f.write_str(label)
    }
}

/// Runtime state for one chain identifier.
#[derive(Debug)]
pub struct ChainContext {
    chain_id: ChainId,
    status: RwLock<RunningStatus>,
    lock: Arc<StampedLock>,
    parameters: ChainParameters,
}

impl ChainContext {
    /// New context in `Initializing`.
    pub fn new(chain_id: ChainId, parameters: ChainParameters) -> Self {
        Self {
            chain_id,
            status: RwLock::new(RunningStatus::Initializing),
            lock: Arc::new(StampedLock::new()),
            parameters,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn status(&self) -> RunningStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: RunningStatus) {
        *self.status.write() = status;
    }

    /// Guard over this chain's master/fork references. The registry only
    /// accepts write guards taken on this lock for this chain.
    pub fn lock(&self) -> &StampedLock {
        &self.lock
    }

    pub fn parameters(&self) -> &ChainParameters {
        &self.parameters
    }
}

/// Failures while registering or activating a chain identifier.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The identifier already has a context.
    #[error("chain {0} is already registered")]
    AlreadyRegistered(ChainId),

    /// The supplied parameters failed validation.
    #[error("invalid parameters for chain {chain_id}: {source}")]
    InvalidParameters {
        /// Offending identifier.
        chain_id: ChainId,
        /// Validation failure.
        #[source]
        source: ConfigError,
    },

    /// The registry refused to initialize the chain.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Provider of [`ChainContext`]s, iterated in ascending chain id order.
#[derive(Debug, Default)]
pub struct ContextManager {
    contexts: RwLock<BTreeMap<ChainId, Arc<ChainContext>>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a context in `Initializing`.
    pub fn register(
        &self,
        chain_id: ChainId,
        parameters: ChainParameters,
    ) -> Result<Arc<ChainContext>, ContextError> {
        parameters
            .validate()
            .map_err(|source| ContextError::InvalidParameters { chain_id, source })?;

        let mut contexts = self.contexts.write();
        if contexts.contains_key(&chain_id) {
            return Err(ContextError::AlreadyRegistered(chain_id));
        }
        let context = Arc::new(ChainContext::new(chain_id, parameters));
        contexts.insert(chain_id, Arc::clone(&context));
        Ok(context)
    }

    /// Registers the chain, gives it a genesis master in `registry`, and
    /// moves it to `Running`. This is the startup path for every chain the
    /// node is configured with.
    pub fn activate(
        &self,
        registry: &ChainRegistry,
        chain_id: ChainId,
        parameters: ChainParameters,
    ) -> Result<Arc<ChainContext>, ContextError> {
        let context = self.register(chain_id, parameters)?;
        let lock = Arc::clone(&context.lock);
        if let Err(e) = registry.init_chain(chain_id, context.parameters(), lock) {
            self.contexts.write().remove(&chain_id);
            return Err(e.into());
        }
        context.set_status(RunningStatus::Running);
        info!(chain_id, "chain activated");
        Ok(context)
    }

    /// Removes the context and the chain's registry entry.
    pub fn deactivate(
        &self,
        registry: &ChainRegistry,
        chain_id: ChainId,
    ) -> Option<Arc<ChainContext>> {
        let removed = self.contexts.write().remove(&chain_id);
        if removed.is_some() {
            registry.remove_chain(chain_id);
            info!(chain_id, "chain deactivated");
        }
        removed
    }

    pub fn get(&self, chain_id: ChainId) -> Option<Arc<ChainContext>> {
        self.contexts.read().get(&chain_id).cloned()
    }

    /// Snapshot of all contexts, ascending by chain id.
    pub fn contexts(&self) -> Vec<Arc<ChainContext>> {
        self.contexts.read().values().cloned().collect()
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.contexts.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::executor::JournalExecutor;

    fn registry() -> ChainRegistry {
        ChainRegistry::new(Arc::new(JournalExecutor::new()))
    }

    #[test]
    fn new_context_is_initializing() {
        let ctx = ChainContext::new(1, ChainParameters::default());
        assert_eq!(ctx.status(), RunningStatus::Initializing);
        assert!(!ctx.lock().is_write_locked());
    }

    #[test]
    fn activate_moves_to_running() {
        let manager = ContextManager::new();
        let registry = registry();
        let ctx = manager
            .activate(&registry, 5, ChainParameters::default())
            .unwrap();
        assert_eq!(ctx.status(), RunningStatus::Running);
        assert_eq!(registry.master_chain(5).unwrap().end_height(), 0);
    }

    #[test]
    fn registry_accepts_only_the_chain_own_guard() {
        let manager = ContextManager::new();
        let registry = registry();
        let one = manager
            .activate(&registry, 1, ChainParameters::default())
            .unwrap();
        let two = manager
            .activate(&registry, 2, ChainParameters::default())
            .unwrap();
        let genesis = registry.master_chain(2).unwrap();
        let block = crate::storage::block::BlockHeader::new(genesis.tip(), 1, "x", &[]);

        let stamp = two.lock().try_optimistic_read().unwrap();
        let err = registry
            .accept_block(&one.lock().write(), 2, block.clone())
            .unwrap_err();
        assert!(matches!(err, RegistryError::ForeignGuard(2)));
        assert_eq!(registry.master_chain(2).unwrap().end_height(), 0);
        assert!(two.lock().validate(&stamp));

        registry.accept_block(&two.lock().write(), 2, block).unwrap();
        assert_eq!(registry.master_chain(2).unwrap().end_height(), 1);
        assert!(!two.lock().validate(&stamp));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let manager = ContextManager::new();
        manager.register(1, ChainParameters::default()).unwrap();
        let err = manager.register(1, ChainParameters::default()).unwrap_err();
        assert!(matches!(err, ContextError::AlreadyRegistered(1)));
    }

    #[test]
    fn invalid_parameters_rejected() {
        let manager = ContextManager::new();
        let params = ChainParameters {
            max_rollback: 0,
            ..ChainParameters::default()
        };
        let err = manager.register(3, params).unwrap_err();
        assert!(matches!(
            err,
            ContextError::InvalidParameters {
                chain_id: 3,
                source: ConfigError::ZeroRollback
            }
        ));
        assert!(manager.is_empty());
    }

    #[test]
    fn contexts_iterate_in_chain_id_order() {
        let manager = ContextManager::new();
        for id in [9, 2, 5] {
            manager.register(id, ChainParameters::default()).unwrap();
        }
        assert_eq!(manager.chain_ids(), vec![2, 5, 9]);
        let ids: Vec<_> = manager.contexts().iter().map(|c| c.chain_id()).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn deactivate_drops_registry_entry() {
        let manager = ContextManager::new();
        let registry = registry();
        manager
            .activate(&registry, 4, ChainParameters::default())
            .unwrap();
        assert!(manager.deactivate(&registry, 4).is_some());
        assert!(manager.get(4).is_none());
        assert!(registry.master_chain(4).is_err());
        assert!(manager.deactivate(&registry, 4).is_none());
    }

    #[test]
    fn status_labels() {
        assert_eq!(RunningStatus::Switching.to_string(), "switching");
        assert_eq!(
            serde_json::to_string(&RunningStatus::Running).unwrap(),
            "\"running\""
        );
    }
}
