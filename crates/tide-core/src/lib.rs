//! # tide-core
//! Foundation types, errors and collaborator traits for the Tide vote-escrow ledger.

pub mod constants;
pub mod error;
pub mod memory;
pub mod traits;
pub mod types;
