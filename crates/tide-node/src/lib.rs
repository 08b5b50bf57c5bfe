//! # tide-node — Ledger composition and persistence.
//!
//! Runs a [`VotingEscrow`](tide_escrow::VotingEscrow) as a single-process
//! ledger:
//! - [`storage::RocksStore`] — persistent escrow state backed by RocksDB
//! - [`node::LedgerNode`] — collaborators wired together, persisted after every mutation
//! - [`config::LedgerConfig`] — layered configuration

pub mod config;
pub mod error;
pub mod node;
pub mod storage;

pub use config::{LedgerConfig, resolve_address};
pub use error::NodeError;
pub use node::LedgerNode;
pub use storage::{RocksStore, StoredState};
