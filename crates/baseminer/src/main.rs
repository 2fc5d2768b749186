//! BaseMiner
//!
//! Client-side tooling for the BaseMiner round contract.
//! Runs one of three modes against an EVM node or an in-memory ledger:
//! the reset watchdog, a read-only round viewer, or a one-shot stake.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use ledger_client::{EvmLedger, InMemoryLedger, LedgerClient};
use round_sync::{
    CountdownTicker, PollState, PollerConfig, PollerHandle, RoundPoller, StakeController,
    SubmissionOutcome, Watchdog,
};
use round_types::{format_amount, RoundId, RoundSnapshot, Square, SQUARE_COUNT};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{ConfigOverrides, MinerConfig};

/// Process mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Advance expired rounds until stopped
    Watchdog,
    /// Follow the current round and its countdown
    Viewer,
    /// Stake on one square and wait for the result
    Stake,
}

/// Ledger backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LedgerKind {
    /// BaseMiner contract over JSON-RPC
    Evm,
    /// Process-local ledger for offline runs
    Memory,
}

/// BaseMiner round client
#[derive(Parser, Debug)]
#[command(name = "baseminer")]
#[command(about = "Viewer, stake client, and reset watchdog for BaseMiner rounds", long_about = None)]
struct Args {
    /// Process mode
    #[arg(long, value_enum, default_value = "viewer")]
    mode: Mode,

    /// Ledger backend
    #[arg(long, value_enum, default_value = "evm")]
    ledger: LedgerKind,

    /// JSON config file; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    /// Hex private key used to sign ledger writes
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Square index to stake on (0-24)
    #[arg(long)]
    square: Option<u8>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => MinerConfig::load(path)?,
        None => MinerConfig::default(),
    }
    .merge(args.overrides.clone());
    config.validate()?;

    let ledger = build_ledger(&args, &config)?;

    match args.mode {
        Mode::Watchdog => run_watchdog(ledger, &config).await,
        Mode::Viewer => run_viewer(ledger, &config, args.ledger).await,
        Mode::Stake => run_stake(ledger, &config, args.square).await,
    }
}

/// Build the ledger client for the selected backend
fn build_ledger(args: &Args, config: &MinerConfig) -> Result<Arc<dyn LedgerClient>> {
    match args.ledger {
        LedgerKind::Memory => {
            tracing::info!(
                "Using in-memory ledger ({}s rounds)",
                config.memory_round_secs
            );
            Ok(Arc::new(InMemoryLedger::new(
                config.memory_round_secs,
                config.entry_fee()?,
            )))
        }
        LedgerKind::Evm => {
            let address = config.contract_address()?;
            tracing::info!("Using BaseMiner at {} via {}", address, config.rpc_url);

            let ledger = match args.private_key.as_deref() {
                Some(key) => EvmLedger::with_private_key(&config.rpc_url, address, key)?,
                None if args.mode == Mode::Viewer => EvmLedger::read_only(&config.rpc_url, address)?,
                None => bail!("{:?} mode needs a signer (use --private-key or PRIVATE_KEY)", args.mode),
            };
            Ok(Arc::new(ledger))
        }
    }
}

fn start_poller(ledger: Arc<dyn LedgerClient>, config: &MinerConfig) -> PollerHandle {
    RoundPoller::new(
        ledger,
        PollerConfig {
            interval: config.poll_interval(),
        },
    )
    .start()
}

/// Run the reset watchdog until Ctrl+C
async fn run_watchdog(ledger: Arc<dyn LedgerClient>, config: &MinerConfig) -> Result<()> {
    tracing::info!("Starting BaseMiner - WATCHDOG MODE");
    tracing::info!("  Check interval: {}s", config.watchdog_interval_secs);
    tracing::info!("Press Ctrl+C to stop.");

    let watchdog = Watchdog::new(ledger, config.watchdog_interval());
    watchdog
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Shutting down watchdog...");
        })
        .await;

    Ok(())
}

/// Log the round and its countdown once per second
async fn run_viewer(
    ledger: Arc<dyn LedgerClient>,
    config: &MinerConfig,
    kind: LedgerKind,
) -> Result<()> {
    tracing::info!("Starting BaseMiner - VIEWER MODE");
    tracing::info!("  Poll interval: {}ms", config.poll_interval_ms);

    // Nobody else advances an in-memory ledger
    let local_watchdog = (kind == LedgerKind::Memory).then(|| {
        let watchdog = Watchdog::new(ledger.clone(), config.watchdog_interval());
        tokio::spawn(watchdog.run(std::future::pending::<()>()))
    });

    let poller = start_poller(ledger, config);
    let mut ticker = CountdownTicker::new(poller.subscribe(), round_sync::system_clock());
    let mut shown_stakes: Option<(RoundId, [round_types::Amount; SQUARE_COUNT])> = None;

    tracing::info!("Press Ctrl+C to stop.");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down viewer...");
                break;
            }
            tick = ticker.tick() => {
                let state = poller.current();
                match tick {
                    None => tracing::info!("Waiting for the first round{}", fetch_note(&state)),
                    Some((snapshot, phase)) => {
                        tracing::info!(
                            "Round {} | pool {} ETH | {}{}",
                            snapshot.round_id(),
                            format_amount(snapshot.total_staked()),
                            phase,
                            fetch_note(&state)
                        );

                        let stakes = (snapshot.round_id(), *snapshot.square_stakes());
                        if shown_stakes.as_ref() != Some(&stakes) {
                            log_stakes(&snapshot);
                            shown_stakes = Some(stakes);
                        }
                    }
                }
            }
        }
    }

    poller.stop();
    if let Some(task) = local_watchdog {
        task.abort();
    }

    tracing::info!("Viewer stopped");
    Ok(())
}

fn fetch_note(state: &PollState) -> &'static str {
    if state.fetch_error {
        " | ledger unreachable, showing last known round"
    } else {
        ""
    }
}

fn log_stakes(snapshot: &RoundSnapshot) {
    let staked: Vec<Square> = Square::all()
        .filter(|square| !snapshot.stake_on(*square).is_zero())
        .collect();
    if staked.is_empty() {
        tracing::info!("Round {}: no stakes yet", snapshot.round_id());
        return;
    }
    for square in staked {
        tracing::info!("  {}: {} ETH", square, format_amount(snapshot.stake_on(square)));
    }
}

/// Stake on one square and wait until the stake resolves
async fn run_stake(
    ledger: Arc<dyn LedgerClient>,
    config: &MinerConfig,
    square: Option<u8>,
) -> Result<()> {
    let index = square.context("Stake mode needs --square <0-24>")?;
    let fee = config.entry_fee()?;

    tracing::info!("Starting BaseMiner - STAKE MODE");
    tracing::info!("  Square index: {}", index);
    tracing::info!("  Entry fee: {} ETH", format_amount(fee));

    let poller = start_poller(ledger.clone(), config);
    let mut controller = StakeController::new(
        ledger,
        fee,
        poller.subscribe(),
        Some(poller.refresher()),
    );

    let result = tokio::select! {
        result = stake_once(&poller, &mut controller, index) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; the stake may still land");
            Ok(())
        }
    };

    poller.stop();
    result
}

async fn stake_once(
    poller: &PollerHandle,
    controller: &mut StakeController,
    index: u8,
) -> Result<()> {
    let mut state = poller.subscribe();
    let snapshot = loop {
        let current = state.borrow_and_update().snapshot.clone();
        if let Some(snapshot) = current {
            break snapshot;
        }
        state.changed().await.context("Poller stopped")?;
    };
    tracing::info!("Current round: {}", snapshot.round_id());

    let square = controller.select(index)?;
    let tx = controller.submit_selected(round_sync::now_unix()).await?;
    tracing::info!("Stake on {} sent: {}", square, tx);

    match controller.wait_for_outcome().await {
        Some(SubmissionOutcome::Confirmed { round_id, square, tx }) => {
            tracing::info!("Stake on {} confirmed in round {} ({})", square, round_id, tx);
            Ok(())
        }
        Some(SubmissionOutcome::Failed { round_id, square, tx }) => {
            bail!("Stake on {} reverted in round {} ({})", square, round_id, tx)
        }
        Some(SubmissionOutcome::Stale {
            target_round_id,
            observed_round_id,
            square,
        }) => bail!(
            "Round {} ended before the stake on {} was seen (now round {})",
            target_round_id,
            square,
            observed_round_id
        ),
        None => bail!("Poller stopped before the stake resolved"),
    }
}
