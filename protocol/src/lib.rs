// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Forkwatch Protocol — Fork Resolution Core
//!
//! A node that follows several independent chains sees competing branches all
//! the time: two producers race at the same height, a partition heals, a slow
//! peer relays a stale branch. This crate decides, per chain identifier, when
//! a competing branch has become authoritative and swaps it in as the master
//! chain without ever exposing a half-switched state.
//!
//! ## Architecture
//!
//! - **config** — Switch policy constants and per-chain [`ChainParameters`].
//! - **context** — Per-chain runtime state: status, the stamped guard, and
//!   the [`ContextManager`] the monitors iterate.
//! - **storage** — Block headers, chains, the [`ChainRegistry`] with its
//!   switch/rollback algorithm, and the [`BlockExecutor`] seam.
//! - **monitor** — The periodic [`ForkChainsMonitor`] and
//!   [`ForkChainsCleaner`], plus the [`ConsensusGate`] they pause.
//!
//! ## Guarantees
//!
//! 1. A failed switch leaves the master chain and executor state exactly as
//!    they were.
//! 2. Every chain's status is back to `Running` when a monitor cycle ends,
//!    panics included.
//! 3. A failure on one chain never stops the cycle for the others.
//!
//! [`ChainParameters`]: config::ChainParameters
//! [`ContextManager`]: context::ContextManager
//! [`ChainRegistry`]: storage::ChainRegistry
//! [`BlockExecutor`]: storage::BlockExecutor
//! [`ForkChainsMonitor`]: monitor::ForkChainsMonitor
//! [`ForkChainsCleaner`]: monitor::ForkChainsCleaner
//! [`ConsensusGate`]: monitor::ConsensusGate

pub mod config;
pub mod context;
pub mod monitor;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;
