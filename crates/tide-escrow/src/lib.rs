//! # tide-escrow — Vote-escrow ledger.
//!
//! Identities lock tokens until a week-aligned unlock time and receive voting
//! weight that decays linearly to zero at that time. The crate keeps:
//! - **Point histories**: a global curve sampled at every week boundary and
//!   every state change, plus one curve per identity.
//! - **A slope-change schedule**: the slope each lock sheds when it expires.
//! - **Historical queries**: weight of an identity or the whole escrow at any
//!   past time or block, with block times interpolated from the history.
//!
//! [`VotingEscrow`] is the entry point; the lower-level modules are public
//! for benchmarks and property tests.

pub mod authorization;
pub mod checkpoint;
pub mod escrow;
pub mod events;
pub mod history;
pub mod query;
pub mod snapshot;

pub use authorization::{Allowlist, RejectContractCallers};
pub use checkpoint::{CheckpointSummary, LockChange, checkpoint};
pub use escrow::VotingEscrow;
pub use events::{DepositKind, EscrowEvent};
pub use history::History;
pub use snapshot::{EscrowSnapshot, StateDelta};
