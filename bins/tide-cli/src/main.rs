//! tide-cli — Command-line interface for a local Tide vote-escrow ledger.
//!
//! Each invocation opens the ledger at the configured data directory, places
//! the clock at `--at`/`--block` (default: wall clock, extrapolated height),
//! runs one command and persists the result.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tide_core::constants::WEEK;
use tide_core::types::{Address, Caller};
use tide_node::{LedgerConfig, LedgerNode, resolve_address};

/// Tide vote-escrow ledger.
#[derive(Parser)]
#[command(name = "tide-cli")]
#[command(version, about = "Lock tokens, earn decaying voting weight.")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// UNIX timestamp to run at (default: now).
    #[arg(long, global = true)]
    at: Option<u64>,

    /// Block height to run at (default: extrapolated from the last run).
    #[arg(long, global = true)]
    block: Option<u64>,

    /// Log output format: "text" or "json".
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Credit tokens to an identity on the asset ledger.
    Mint(MintArgs),
    /// Lock tokens until a future week.
    CreateLock(CreateLockArgs),
    /// Add tokens to a running lock.
    IncreaseAmount(IncreaseAmountArgs),
    /// Extend a running lock.
    IncreaseUnlockTime(IncreaseUnlockTimeArgs),
    /// Add tokens to someone else's running lock.
    DepositFor(DepositForArgs),
    /// Withdraw an expired lock.
    Withdraw(CallerArgs),
    /// Bring the global curve up to date.
    Checkpoint,
    /// Show voting weight of an identity.
    Balance(BalanceArgs),
    /// Show total voting weight.
    Supply(PointInTime),
    /// Show the lock of an identity.
    Lock(IdentityArg),
    /// Admit a contract caller (owner only).
    AllowCaller(AllowCallerArgs),
}

/// Identities are 40-hex addresses or labels.
#[derive(Args)]
struct CallerArgs {
    /// Calling identity; owns the lock.
    #[arg(short, long)]
    sender: String,

    /// Transaction originator, when the sender is a contract.
    #[arg(long)]
    origin: Option<String>,
}

impl CallerArgs {
    fn caller(&self) -> Caller {
        let sender = resolve_address(&self.sender);
        match &self.origin {
            Some(origin) => Caller::contract(sender, resolve_address(origin)),
            None => Caller::direct(sender),
        }
    }
}

#[derive(Args)]
struct UnlockArgs {
    /// Unlock time as a UNIX timestamp (rounded down to a week).
    #[arg(long, conflicts_with = "weeks")]
    unlock_time: Option<u64>,

    /// Unlock time in weeks from now.
    #[arg(long)]
    weeks: Option<u64>,
}

impl UnlockArgs {
    fn resolve(&self, now: u64) -> Result<u64> {
        match (self.unlock_time, self.weeks) {
            (Some(t), _) => Ok(t),
            (None, Some(w)) => Ok(now + w * WEEK),
            (None, None) => bail!("either --unlock-time or --weeks is required"),
        }
    }
}

#[derive(Args)]
struct MintArgs {
    #[arg(short, long)]
    to: String,

    /// Amount in whole tokens, decimals allowed (e.g. 10.5).
    #[arg(short, long)]
    amount: String,
}

#[derive(Args)]
struct CreateLockArgs {
    #[command(flatten)]
    caller: CallerArgs,

    #[arg(short, long)]
    amount: String,

    #[command(flatten)]
    unlock: UnlockArgs,
}

#[derive(Args)]
struct IncreaseAmountArgs {
    #[command(flatten)]
    caller: CallerArgs,

    #[arg(short, long)]
    amount: String,
}

#[derive(Args)]
struct IncreaseUnlockTimeArgs {
    #[command(flatten)]
    caller: CallerArgs,

    #[command(flatten)]
    unlock: UnlockArgs,
}

#[derive(Args)]
struct DepositForArgs {
    #[command(flatten)]
    caller: CallerArgs,

    /// Owner of the lock to top up.
    #[arg(short, long)]
    to: String,

    #[arg(short, long)]
    amount: String,
}

#[derive(Args)]
struct IdentityArg {
    identity: String,
}

#[derive(Args)]
struct PointInTime {
    /// Evaluate at a past UNIX timestamp.
    #[arg(long, conflicts_with = "at_block")]
    at_time: Option<u64>,

    /// Evaluate at a past block height.
    #[arg(long)]
    at_block: Option<u64>,
}

#[derive(Args)]
struct BalanceArgs {
    identity: String,

    #[command(flatten)]
    when: PointInTime,
}

#[derive(Args)]
struct AllowCallerArgs {
    /// Administrator identity.
    #[arg(long)]
    admin: String,

    /// Contract identity to admit.
    contract: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LedgerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.log_level, &cli.log_format);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create directory: {}", config.data_dir.display()))?;
    let node = LedgerNode::open(config, cli.at, cli.block).context("Failed to open ledger")?;
    let decimals = node.escrow().metadata().decimals;
    let now = node.context().timestamp;

    match cli.command {
        Commands::Mint(args) => {
            let to = resolve_address(&args.to);
            node.mint(&to, parse_amount(&args.amount, decimals)?)?;
            println!("Balance of {to}: {}", format_amount(node.ledger().balance_of(&to), decimals));
        }
        Commands::CreateLock(args) => {
            let caller = args.caller.caller();
            let value = parse_amount(&args.amount, decimals)?;
            node.create_lock(caller, value, args.unlock.resolve(now)?)
                .context("create-lock failed")?;
            print_lock(&node, &caller.sender);
        }
        Commands::IncreaseAmount(args) => {
            let caller = args.caller.caller();
            node.increase_amount(caller, parse_amount(&args.amount, decimals)?)
                .context("increase-amount failed")?;
            print_lock(&node, &caller.sender);
        }
        Commands::IncreaseUnlockTime(args) => {
            let caller = args.caller.caller();
            node.increase_unlock_time(caller, args.unlock.resolve(now)?)
                .context("increase-unlock-time failed")?;
            print_lock(&node, &caller.sender);
        }
        Commands::DepositFor(args) => {
            let to = resolve_address(&args.to);
            node.deposit_for(args.caller.caller(), to, parse_amount(&args.amount, decimals)?)
                .context("deposit-for failed")?;
            print_lock(&node, &to);
        }
        Commands::Withdraw(args) => {
            let caller = args.caller();
            node.withdraw(caller).context("withdraw failed")?;
            println!(
                "Withdrawn. Balance of {}: {}",
                caller.sender,
                format_amount(node.ledger().balance_of(&caller.sender), decimals)
            );
        }
        Commands::Checkpoint => {
            node.checkpoint()?;
            println!("Global epoch: {}", node.escrow().epoch());
        }
        Commands::Balance(args) => {
            let who = resolve_address(&args.identity);
            let escrow = node.escrow();
            let weight = match (args.when.at_time, args.when.at_block) {
                (Some(t), _) => escrow.balance_of_at_time(&who, t),
                (None, Some(b)) => escrow.balance_of_at_block(&who, b)?,
                (None, None) => escrow.balance_of(&who),
            };
            println!("{} {}", format_amount(weight, decimals), escrow.metadata().symbol);
        }
        Commands::Supply(when) => {
            let escrow = node.escrow();
            let supply = match (when.at_time, when.at_block) {
                (Some(t), _) => escrow.total_supply_at_time(t),
                (None, Some(b)) => escrow.total_supply_at_block(b)?,
                (None, None) => escrow.total_supply(),
            };
            println!("{} {}", format_amount(supply, decimals), escrow.metadata().symbol);
            println!("Locked: {}", format_amount(escrow.total_locked(), decimals));
        }
        Commands::Lock(args) => print_lock(&node, &resolve_address(&args.identity)),
        Commands::AllowCaller(args) => {
            let contract = resolve_address(&args.contract);
            node.allow_caller(&resolve_address(&args.admin), contract)
                .context("allow-caller failed")?;
            println!("Allowed contract callers:");
            for addr in node.allowed_callers() {
                println!("  {addr}");
            }
        }
    }

    Ok(())
}

/// Initialize tracing. `RUST_LOG` overrides the configured level.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn print_lock(node: &LedgerNode, who: &Address) {
    let escrow = node.escrow();
    let decimals = escrow.metadata().decimals;
    let lock = escrow.locked(who);
    let end = chrono::DateTime::from_timestamp(lock.end as i64, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| lock.end.to_string());

    println!("Identity:    {who}");
    println!("Locked:      {}", format_amount(lock.amount.max(0) as u128, decimals));
    println!("Unlocks:     {}", if lock.end == 0 { "-".to_string() } else { end });
    println!("Weight:      {} {}", format_amount(escrow.balance_of(who), decimals), escrow.metadata().symbol);
    println!("Slope:       {}", escrow.get_last_user_slope(who));
    println!("User epoch:  {}", escrow.user_point_epoch(who));
}

/// Parse a decimal token amount into base units.
fn parse_amount(s: &str, decimals: u8) -> Result<u128> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if frac.len() > decimals as usize {
        bail!("Amount {s} has more than {decimals} decimal places");
    }
    let scale = 10u128
        .checked_pow(decimals as u32)
        .context("Decimals too large")?;
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().with_context(|| format!("Invalid amount: {s}"))? };
    let frac_units: u128 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<width$}", width = decimals as usize);
        padded.parse().with_context(|| format!("Invalid amount: {s}"))?
    };
    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .with_context(|| format!("Amount overflow: {s}"))
}

/// Format base units as a decimal token amount, trimming trailing zeros.
fn format_amount(units: u128, decimals: u8) -> String {
    let Some(scale) = 10u128.checked_pow(decimals as u32) else {
        return units.to_string();
    };
    let whole = units / scale;
    let frac = units % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0>width$}", width = decimals as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
