//! leasegridd — the LeaseGrid daemon.
//!
//! Single binary that assembles the leasing service:
//! - State store (redb)
//! - Resource pool matcher (with periodic definition reload)
//! - Scheduler adapter + lease sweeper
//! - Spot/backfill market manager + backfill driver
//!
//! # Usage
//!
//! ```text
//! leasegridd run --config /etc/leasegrid/leasegridd.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use leasegrid_market::{
    AsyncRequestManager, BackfillDriver, BackfillSettings, MarketSettings, MaximizeUtilization,
    SlotBackedLauncher,
};
use leasegrid_pool::{load_pool_dir, PoolMatcher};
use leasegrid_scheduler::{PoolSlotManager, Scheduler, StoreInstanceHome, Sweeper};
use leasegrid_state::StateStore;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "leasegridd", about = "LeaseGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Path to the daemon configuration file.
        #[arg(long, default_value = "/etc/leasegrid/leasegridd.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,leasegridd=debug,leasegrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(config::load_config(&config)?).await,
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("LeaseGrid daemon starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("leasegrid.redb");

    // ── Assemble subsystems ────────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let defs = load_pool_dir(&config.pool_dir)?;
    let matcher = Arc::new(PoolMatcher::open(state.clone(), defs)?);
    let totals = matcher.totals();
    info!(
        free_mb = totals.free_mb,
        max_mb = totals.max_mb,
        "resource pools loaded"
    );

    let home = Arc::new(StoreInstanceHome::new(state.clone()));
    let slots = Arc::new(PoolSlotManager::new(matcher.clone(), state.clone(), None));
    let scheduler = Arc::new(Scheduler::new(state.clone(), home.clone(), slots)?);
    info!("scheduler initialized");

    let launcher = Arc::new(SlotBackedLauncher::new(
        matcher.clone(),
        state.clone(),
        scheduler.clone(),
    ));
    let manager = Arc::new(AsyncRequestManager::new(
        state.clone(),
        matcher.clone(),
        launcher,
        Box::new(MaximizeUtilization {
            min_price: config.market.min_price,
        }),
        MarketSettings {
            spot_enabled: config.market.spot_enabled,
            backfill_enabled: config.market.backfill_enabled,
            min_price: config.market.min_price,
            max_utilization: config.market.max_utilization,
            min_reserved_mb: config.market.min_reserved_mb,
            instance_mem_mb: config.market.instance_mem_mb,
        },
    )?);

    // The market hears guaranteed-tier changes and hands capacity back
    // when the scheduler runs out.
    scheduler.add_listener(manager.clone());
    scheduler.set_reclaimer(manager.clone());
    manager.init()?;
    info!("market manager initialized");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = Sweeper::new(
        scheduler.clone(),
        home.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        config.sweep_grace_secs,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let backfill = BackfillDriver::new(
        manager.clone(),
        BackfillSettings {
            enabled: config.market.backfill_enabled,
            cap: config.market.backfill_cap,
            instance_count: config.market.backfill_instance_count,
            memory_mb: config.market.instance_mem_mb,
            caller: "backfill".to_string(),
            interval: Duration::from_secs(config.market.backfill_interval_secs),
            max_interval: Duration::from_secs(config.market.backfill_max_interval_secs),
        },
    );
    let backfill_handle = tokio::spawn(backfill.run(shutdown_rx.clone()));

    let reload_handle = tokio::spawn(reload_pools(
        matcher.clone(),
        config.pool_dir.clone(),
        Duration::from_secs(config.pool_reload_secs),
        shutdown_rx,
    ));

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = sweeper_handle.await;
    let _ = backfill_handle.await;
    let _ = reload_handle.await;

    info!("LeaseGrid daemon stopped");
    Ok(())
}

/// Periodically re-read the pool definition directory and fold changes
/// into the matcher, preserving in-use accounting.
async fn reload_pools(
    matcher: Arc<PoolMatcher>,
    pool_dir: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // pools were just loaded at startup
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match load_pool_dir(&pool_dir) {
                    Ok(defs) => {
                        if let Err(e) = matcher.reload(defs) {
                            error!(error = %e, "pool reload failed");
                        }
                    }
                    Err(e) => error!(error = %e, "pool definitions unreadable, keeping current set"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
