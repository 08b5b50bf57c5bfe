//! Scenario and property test suite for the Tide vote-escrow ledger.
//!
//! Integration tests drive a [`VotingEscrow`](tide_escrow::VotingEscrow)
//! through full lock lifecycles, randomized operation sequences, hostile
//! collaborators and process restarts, checking the ledger's invariants
//! after every step.

pub mod helpers;
