//! BFT validator node
//!
//! ```bash
//! # Run validator 0 of the built-in four-node local network
//! chain-node --dev 0
//!
//! # Run from a configuration file
//! chain-node --config node.toml --log-level debug
//! ```
//!
//! Example configuration:
//!
//! ```toml
//! [node]
//! key_seed = "validator-0"
//! metrics_log_interval_secs = 30
//!
//! [consensus]
//! propose_timeout_ms = 1000
//! prevote_timeout_ms = 2000
//! precommit_timeout_ms = 1000
//!
//! [network]
//! listen_address = "0.0.0.0:3000"
//!
//! [[consensus.validators]]
//! address = "0x..."
//! public_key = "02..."
//! network_address = "10.0.0.1:3000"
//! stake = 40
//! ```

mod config;

use anyhow::{bail, Context, Result};
use chain_consensus::{ConsensusEngine, ConsensusMetrics, MemoryLedger, MemoryTxPool};
use chain_core::{Address, Signer, SigningKey, Transaction};
use chain_network::{serve, TcpBroadcaster};
use clap::Parser;
use config::NodeConfig;
use prometheus::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// BFT validator node
#[derive(Parser, Debug)]
#[command(name = "chain-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "CHAIN_NODE_CONFIG", conflicts_with = "dev")]
    config: Option<PathBuf>,

    /// Run validator N of the built-in local network
    #[arg(long, value_name = "N")]
    dev: Option<usize>,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Seed the pool with signed transfers from a fixed development account
fn seed_dev_transactions(pool: &MemoryTxPool, count: u64) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let faucet = SigningKey::from_seed(b"dev-faucet").context("Failed to derive faucet key")?;
    let recipient = Address::new([0x11; 20]);
    for nonce in 0..count {
        let tx = Transaction::signed_transfer(&faucet, nonce, recipient, 1)
            .context("Failed to sign dev transaction")?;
        pool.add_transaction(tx);
    }
    info!("Seeded {} dev transactions from {}", count, faucet.address());
    Ok(())
}

fn spawn_metrics_log(metrics: ConsensusMetrics, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    info!(
                        height = metrics.current_height.get(),
                        round = metrics.current_round.get(),
                        committed = metrics.rounds_committed.get(),
                        reputation = metrics.local_reputation.get(),
                        "Consensus metrics"
                    );
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = match (&cli.config, cli.dev) {
        (Some(path), _) => NodeConfig::load(path)?,
        (None, Some(index)) => NodeConfig::dev(index)?,
        (None, None) => bail!("Either --config or --dev must be given"),
    };

    let key = config.signing_key()?;
    info!("Validator {} starting", key.address());

    let registry = Registry::new();
    let metrics = ConsensusMetrics::new(&registry).context("Failed to register metrics")?;

    let ledger = Arc::new(MemoryLedger::new());
    let pool = Arc::new(MemoryTxPool::new());
    seed_dev_transactions(&pool, config.node.dev_transactions)?;

    let broadcaster = Arc::new(TcpBroadcaster::new(&config.network));
    info!("Broadcasting to {} peers", broadcaster.peers().len());

    let mut engine = ConsensusEngine::builder(config.consensus.clone(), Arc::new(key))
        .ledger(ledger)
        .pool(pool)
        .broadcaster(broadcaster)
        .metrics(metrics.clone())
        .build()
        .context("Failed to build consensus engine")?;

    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(config.network.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.network.listen_address))?;
    let server = tokio::spawn(serve(
        listener,
        engine.handler(),
        config.network.clone(),
        shutdown.clone(),
    ));

    let eviction = engine
        .seen_cache()
        .spawn_eviction(config.consensus.seen_cache_clear_interval(), shutdown.clone());

    if config.node.metrics_log_interval_secs > 0 {
        spawn_metrics_log(
            metrics,
            Duration::from_secs(config.node.metrics_log_interval_secs),
            shutdown.clone(),
        );
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Finishing the current round before shutdown");
        signal_token.cancel();
    });

    engine.run(shutdown.clone()).await;

    shutdown.cancel();
    let _ = tokio::join!(server, eviction);
    info!("Validator stopped");
    Ok(())
}
