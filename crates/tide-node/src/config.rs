//! Ledger configuration.
//!
//! Provides [`LedgerConfig`] with defaults for the data directory, logging,
//! administration and token metadata. Values are layered: built-in defaults,
//! then an optional TOML file, then `TIDE_*` environment variables
//! (`TIDE_LOG_LEVEL`, `TIDE_OWNER`, `TIDE_ALLOWED_CALLERS=a,b`, ...).

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tide_core::constants::DEFAULT_DECIMALS;
use tide_core::memory::DEFAULT_BLOCK_TIME_SECS;
use tide_core::types::{Address, EscrowMetadata};

/// Configuration for a ledger instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "tide_escrow=debug").
    pub log_level: String,
    /// Administrator identity: 40-hex address or a label.
    pub owner: String,
    /// Contract identities admitted by the caller predicate at startup.
    pub allowed_callers: Vec<String>,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Seconds per block used to derive heights when none is given.
    pub block_time_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tide");
        let metadata = EscrowMetadata::default();

        Self {
            data_dir,
            log_level: "info".to_string(),
            owner: "admin".to_string(),
            allowed_callers: Vec::new(),
            name: metadata.name,
            symbol: metadata.symbol,
            decimals: DEFAULT_DECIMALS,
            block_time_secs: DEFAULT_BLOCK_TIME_SECS,
        }
    }
}

impl LedgerConfig {
    /// Layer an optional TOML file and `TIDE_*` environment variables over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("TIDE")
                    .prefix_separator("_")
                    .list_separator(",")
                    .with_list_parse_key("allowed_callers")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Path to the RocksDB escrow data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("escrowdata")
    }

    pub fn owner_address(&self) -> Address {
        resolve_address(&self.owner)
    }

    pub fn allowed_addresses(&self) -> Vec<Address> {
        self.allowed_callers.iter().map(|s| resolve_address(s)).collect()
    }

    pub fn metadata(&self) -> EscrowMetadata {
        EscrowMetadata {
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            decimals: self.decimals,
            ..EscrowMetadata::default()
        }
    }
}

/// Parse a 40-hex address, or derive one from a label.
pub fn resolve_address(s: &str) -> Address {
    s.parse().unwrap_or_else(|_| Address::from_label(s))
}
