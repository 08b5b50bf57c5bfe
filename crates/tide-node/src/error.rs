//! Errors raised while composing and running a ledger.
use thiserror::Error;

use tide_core::error::EscrowError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)] Escrow(#[from] EscrowError),
    #[error("configuration: {0}")] Config(#[from] config::ConfigError),
    #[error("clock moved backwards: last state at {last}, requested {requested}")] ClockRegression { last: u64, requested: u64 },
    #[error("block height moved backwards: last state at {last}, requested {requested}")] HeightRegression { last: u64, requested: u64 },
}
