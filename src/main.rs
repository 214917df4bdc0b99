// =============================================================================
// Kestrel Perp Scalper — Main Entry Point
// =============================================================================
//
// Startup order: env + CLI + config (exit 1 on config trouble), exchange
// bootstrap (balance, instruments, candle backfill; exit 2 when the exchange
// is unreachable), then the long-lived tasks:
//
//   - public WebSocket (tickers + books) with its own reconnect supervisor
//   - business WebSocket (candles) with its own reconnect supervisor
//   - fast-path exit checker fed by the tick channel
//   - funding-rate refresher (slow tier)
//   - drift reconciliation loop
//   - the periodic trading cycle
//
// SIGINT lets the cycle finish its current pass, gives the sockets a short
// drain for TLS teardown, and exits 130.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod config;
mod cycle;
mod error;
mod executor;
mod exits;
mod gateway;
mod indicators;
mod journal;
mod market_data;
mod params;
mod position;
mod reconcile;
mod regime;
mod risk;
mod signals;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::BotConfig;
use crate::executor::OrderExecutor;
use crate::gateway::client::OkxClient;
use crate::journal::Journal;
use crate::types::Timeframe;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_EXCHANGE_UNREACHABLE: i32 = 2;
const EXIT_SIGINT: i32 = 130;

/// Largest candle backfill one REST request returns.
const BACKFILL_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Futures,
    Spot,
}

#[derive(Parser, Debug)]
#[command(name = "kestrel-bot", about = "Adaptive perpetual-futures scalping engine")]
struct Cli {
    /// Trading mode. Only `futures` is implemented in this build.
    #[arg(value_enum, default_value_t = Mode::Futures)]
    mode: Mode,

    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Root directory for trade/signal journals.
    #[arg(long, default_value = "journal")]
    journal_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("╔══════════════════════════════════════════════════════╗");
    info!("║            Kestrel Perp Scalper — Starting           ║");
    info!("╚══════════════════════════════════════════════════════╝");

    if cli.mode != Mode::Futures {
        error!("spot mode is not supported in this build");
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    // ── 1. Configuration ─────────────────────────────────────────────────
    let mut config = match BotConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "failed to load config");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "config validation failed");
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    // Override symbols from the environment when provided.
    if let Ok(raw) = std::env::var("KESTREL_SYMBOLS") {
        let symbols: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !symbols.is_empty() {
            config.symbols = symbols;
        }
    }
    info!(symbols = ?config.symbols, "configured instruments");

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("OKX_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("OKX_API_SECRET").unwrap_or_default();
    let passphrase = std::env::var("OKX_API_PASSPHRASE").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("OKX credentials missing — market data will flow, orders will fail");
    }
    let client = Arc::new(OkxClient::new(api_key, api_secret, passphrase));

    // ── 3. Bootstrap: balance, instruments, candle backfill ──────────────
    let equity = match client.get_balance().await {
        Ok(equity) => {
            info!(equity_usd = equity, "exchange balance fetched");
            equity.max(0.0)
        }
        Err(e) => {
            error!(error = %e, "exchange unreachable during startup");
            std::process::exit(EXIT_EXCHANGE_UNREACHABLE);
        }
    };

    let journal = Journal::new(&cli.journal_dir);
    let state = Arc::new(AppState::new(config, equity, journal));

    for symbol in &state.config.symbols {
        match client.get_instrument(symbol).await {
            Ok(instrument) => {
                info!(
                    symbol,
                    ct_val = instrument.ct_val,
                    lot = instrument.lot_size,
                    tick = instrument.tick_size,
                    maker = instrument.maker_fee,
                    taker = instrument.taker_fee,
                    "instrument loaded"
                );
                state.set_instrument(instrument);
            }
            Err(e) => {
                error!(symbol, error = %e, "instrument metadata unavailable");
                std::process::exit(EXIT_EXCHANGE_UNREACHABLE);
            }
        }

        for tf in Timeframe::ALL {
            let limit = tf.capacity().min(BACKFILL_LIMIT);
            match client.get_candles(symbol, tf, limit).await {
                Ok(candles) => {
                    debug!(symbol, bar = tf.bar(), count = candles.len(), "candles backfilled");
                    if let Err(e) = state.journal.record_candles_init(symbol, tf, &candles) {
                        warn!(symbol, error = %e, "failed to journal candle backfill");
                    }
                    state
                        .market
                        .candles
                        .seed(market_data::CandleKey::new(symbol, tf), candles);
                }
                Err(e) => {
                    warn!(symbol, bar = tf.bar(), error = %e, "candle backfill failed — WS will fill in");
                }
            }
        }

        match client.get_funding_rate(symbol).await {
            Ok(rate) => state.market.store_funding_rate(symbol, rate),
            Err(e) => debug!(symbol, error = %e, "funding prefetch failed"),
        }
    }

    // ── 4. Executor ──────────────────────────────────────────────────────
    let exec = Arc::new(OrderExecutor::new(
        client.clone(),
        state.market.clone(),
        state.config.order_executor.limit_order.clone(),
    ));

    // ── 5. WebSocket supervisors ─────────────────────────────────────────
    let (tick_tx, tick_rx) = tokio::sync::mpsc::unbounded_channel();

    {
        let symbols = state.config.symbols.clone();
        let registry = state.market.clone();
        let tick_tx = tick_tx.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    gateway::ws::run_public_stream(&symbols, &registry, &tick_tx).await
                {
                    error!(error = %e, "public WebSocket error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    {
        let symbols = state.config.symbols.clone();
        let registry = state.market.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = gateway::ws::run_candle_stream(&symbols, &registry).await {
                    error!(error = %e, "candle WebSocket error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // ── 6. Fast-path exit checker ────────────────────────────────────────
    tokio::spawn(cycle::run_fast_path(state.clone(), exec.clone(), tick_rx));

    // ── 7. Funding-rate refresher (slow tier) ────────────────────────────
    {
        let state = state.clone();
        let client = client.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(25));
            loop {
                interval.tick().await;
                for symbol in &state.config.symbols {
                    match client.get_funding_rate(symbol).await {
                        Ok(rate) => state.market.store_funding_rate(symbol, rate),
                        Err(e) => debug!(symbol, error = %e, "funding refresh failed"),
                    }
                }
            }
        });
    }

    // ── 8. Reconciliation loop ───────────────────────────────────────────
    {
        let state = state.clone();
        let client = client.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Err(e) = reconcile::reconcile_once(&state, &client).await {
                    warn!(error = %e, "reconciliation failed");
                }
            }
        });
    }

    // ── 9. Trading cycle + graceful shutdown ─────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let cycle_handle = {
        let state = state.clone();
        let client = client.clone();
        let exec = exec.clone();
        tokio::spawn(async move {
            // Let the streams warm the caches before the first pass.
            tokio::time::sleep(Duration::from_secs(5)).await;
            info!("trading cycle starting");

            let mut interval = tokio::time::interval(Duration::from_secs(
                state.config.scalping.cycle_interval_secs.max(1),
            ));
            let mut degraded = false;
            let mut cycles: u64 = 0;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.changed() => {
                        info!("shutdown requested — cycle loop exiting");
                        return;
                    }
                }

                let started = Instant::now();
                cycle::run_trading_cycle(&state, &client, &exec, degraded).await;
                let elapsed = started.elapsed().as_secs_f64();

                degraded = elapsed > state.config.scalping.slow_cycle_warn_secs;
                if degraded {
                    warn!(
                        elapsed_secs = elapsed,
                        budget_secs = state.config.scalping.slow_cycle_warn_secs,
                        "slow cycle — degrading REST-derived filters next pass"
                    );
                }

                cycles += 1;
                if cycles % 30 == 0 {
                    let risk = state.risk.snapshot();
                    let open_positions = state.positions.count().await;
                    info!(
                        cycles,
                        open_positions,
                        equity = risk.equity_usd,
                        daily_pnl = risk.daily_pnl,
                        risk_mode = %risk.risk_mode,
                        counters = ?state.counters_snapshot(),
                        "engine status"
                    );
                }
            }
        })
    };

    info!("all subsystems running — Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    warn!("shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    let _ = cycle_handle.await;

    // Drain window for WebSocket/TLS teardown.
    tokio::time::sleep(Duration::from_millis(600)).await;

    info!("Kestrel shut down complete");
    std::process::exit(EXIT_SIGINT);
}
