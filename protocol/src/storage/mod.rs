//! # Storage Module
//!
//! In-memory chain bookkeeping for every tracked chain identifier.
//!
//! ## Architecture
//!
//! ```text
//! block.rs     — Block headers, BLAKE3 hashing, Merkle roots
//! chain.rs     — Contiguous header runs, fork points, fork-set ordering
//! executor.rs  — The state machine blocks are applied to / rolled back from
//! registry.rs  — Master + fork chains per identifier, the atomic switch
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! BlockHeader → accept_block → master tip ──apply──> BlockExecutor
//!                     │
//!                     └──────> fork set ──switch_chain──> master
//! ```
//!
//! Only master-chain blocks are ever applied to the executor. Fork blocks sit
//! in the registry until a switch adopts them or the cleaner evicts them.

pub mod block;
pub mod chain;
pub mod executor;
pub mod registry;

pub use block::{BlockError, BlockHeader};
pub use chain::{Chain, ChainError, ForkKey};
pub use executor::{BlockExecutor, ExecutionError, JournalExecutor};
pub use registry::{
    ChainRegistry, Placement, RegistryError, RollbackReason, SwitchError, SwitchOutcome,
};
