// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/close_watch

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(feed_mode|venue_mode|subject)'

# event & action per coin
curl -s localhost:9898/metrics | grep '^close_events_total'
curl -s localhost:9898/metrics | grep '^actions_total'

# re-arm coin setelah posisi ditutup manual
cargo run -- state reset ETH

*/
/*
=============================================================================
Project : close_watch — idempotent close-long follower in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Watches a Hyperliquid address (websocket or polling) for fills that
          close a long, deduplicates them, and opens exactly one short per
          coin on Binance futures, guarded by a durable trade-state file.
          Exposes Prometheus metrics, Telegram notices and JSONL records.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod wire;             // Hyperliquid wire format + canonicalization
mod ledger;
mod classifier;
mod trade_state;
mod throttle;
mod poll;             // transport: HTTP polling
mod stream;           // transport: websocket userFills
mod monitor;          // orchestrator
mod status;
mod notifier;
mod gateway;          // action contract + paper venue
mod binance;          // helper (signer/types) for Binance futures
mod gateway_binance;  // real Binance USDⓈ-M futures

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::{
    sync::{mpsc, watch},
    time::{timeout, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, FeedMode, VenueMode};
use crate::domain::{ActionParams, Event, Notice, TransportEvent};
use crate::gateway::ActionExecutor;
use crate::notifier::Notifier;
use crate::trade_state::TradeStateStore;

const PAPER_FILL_DELAY: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "close_watch", version, about = "Follow close-long fills with a one-shot short per coin")]
struct Cli {
    /// Trade state file (overrides TRADE_STATE_FILE)
    #[arg(long, global = true)]
    state_file: Option<String>,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start watching (default)
    Run,
    /// Inspect or reset the trade state
    State {
        #[command(subcommand)]
        action: StateCmd,
    },
}

#[derive(Subcommand, Debug)]
enum StateCmd {
    List,
    /// Re-arm one coin
    Reset { coin: String },
    ResetAll,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // ---- Load config ----
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            init_logging("info");
            error!(error = %e, "config error");
            std::process::exit(2);
        }
    };
    init_logging(&args.log_level);

    let state_path = cli.state_file.clone().unwrap_or_else(|| args.trade_state_file.clone());
    match cli.cmd.unwrap_or(Cmd::Run) {
        Cmd::Run => run(args, state_path).await,
        Cmd::State { action } => {
            if let Err(e) = admin(action, &state_path) {
                error!(error = %e, "state command failed");
                std::process::exit(1);
            }
        }
    }
}

fn admin(action: StateCmd, state_path: &str) -> Result<(), trade_state::PersistenceError> {
    let store = TradeStateStore::open(state_path);
    match action {
        StateCmd::List => {
            let all = store.list();
            if all.is_empty() {
                println!("(no trade state in {})", store.path().display());
            }
            for (coin, r) in all {
                println!("{coin:<6} opened={:<5} at={} order={}", r.opened, r.timestamp_iso, r.action_ref);
            }
        }
        StateCmd::Reset { coin } => {
            let coin = coin.trim().to_ascii_uppercase();
            if store.reset(&coin)? {
                info!(%coin, "trade state reset");
            } else {
                warn!(%coin, "no trade state for coin");
            }
        }
        StateCmd::ResetAll => {
            let n = store.reset_all()?;
            info!(cleared = n, "trade state cleared");
        }
    }
    Ok(())
}

fn build_executor(args: &Args) -> Arc<dyn ActionExecutor> {
    match args.venue_mode {
        VenueMode::Mock => Arc::new(gateway::PaperExecutor::new(args.trading_pairs.clone(), PAPER_FILL_DELAY)),
        VenueMode::BinanceTestnet | VenueMode::BinanceMainnet => Arc::new(gateway_binance::BinanceFutures::new(
            args.binance_rest_url.clone(),
            args.binance_api_key.clone(),
            args.binance_api_secret.clone(),
            args.binance_recv_window,
            args.trading_pairs.clone(),
        )),
    }
}

fn build_notifier(args: &Args) -> Arc<dyn Notifier> {
    if args.telegram.usable() {
        info!("telegram notices enabled");
        return Arc::new(notifier::TelegramNotifier::new(&args.telegram.bot_token, &args.telegram.chat_id));
    }
    if args.telegram.enabled {
        warn!("TELEGRAM_ENABLED but token/chat id missing, notices go to the log");
    }
    Arc::new(notifier::LogNotifier)
}

async fn run(args: Args, state_path: String) {
    if let Err(e) = args.validate_for_run() {
        error!(error = %e, "invalid config");
        std::process::exit(2);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- Metrics ----
    metrics::init();
    if args.metrics_port != 0 {
        tokio::spawn(metrics::serve_metrics(args.metrics_port, shutdown_rx.clone()));
    }

    // ---- Human-friendly startup info + export config to metrics ----
    info!(
        address = %args.monitor_address,
        feed_mode = args.feed_mode.as_str(),
        venue_mode = args.venue_mode.as_str(),
        pairs = ?args.trading_pairs,
        leverage = args.leverage,
        margin = %args.margin,
        state_file = %state_path,
        hl_api = %args.hl_api_url,
        hl_ws = %args.hl_ws_url,
        binance_rest = %args.binance_rest_url,
        "startup config"
    );
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    metrics::CONFIG_VENUE_MODE.with_label_values(&[args.venue_mode.as_str()]).set(1);
    for coin in args.tracked_subjects() {
        metrics::CONFIG_SUBJECT.with_label_values(&[&coin]).set(1);
    }

    // ---- Durable state + collaborators ----
    let state = Arc::new(TradeStateStore::open(&state_path));
    let executor = build_executor(&args);

    let (notice_tx, notice_rx) = mpsc::channel::<Notice>(256);
    let notifier_task = tokio::spawn(notifier::run(build_notifier(&args), notice_rx));
    let notices = notifier::NoticeSink::new(notice_tx);

    // ---- Recorder (optional) ----
    let (rec_tx, recorder_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };

    let limiter = Arc::new(throttle::RateLimiter::new(args.api_min_interval));
    let info_client = Arc::new(poll::InfoClient::new(
        args.hl_api_url.clone(),
        args.monitor_address.clone(),
        limiter,
        args.rate_limit_cooldown,
    ));

    // ---- Startup check + summary ----
    status::startup(&args, &info_client, executor.as_ref(), &state, &notices).await;

    // ---- Orchestrator ----
    let monitor = Arc::new(monitor::Monitor::new(
        Arc::new(ledger::DedupLedger::new()),
        classifier::Classifier::new(args.tracked_subjects()),
        state.clone(),
        executor.clone(),
        ActionParams { leverage: args.leverage, margin: args.margin },
        notices.clone(),
        rec_tx.clone(),
    ));
    drop(notices);
    drop(rec_tx);

    // ---- Transport ----
    let (ev_tx, ev_rx) = mpsc::channel::<TransportEvent>(1024);
    let transport_task = match args.feed_mode {
        FeedMode::Ws => {
            let cfg = stream::StreamConfig {
                ws_url: args.hl_ws_url.clone(),
                user: args.monitor_address.clone(),
                connect_timeout: Duration::from_secs(10),
                heartbeat_interval: args.heartbeat_interval,
                pong_timeout: args.pong_timeout,
                reconnect_delay: args.reconnect_delay,
            };
            tokio::spawn(stream::StreamTransport::new(cfg, ev_tx).run(shutdown_rx.clone()))
        }
        FeedMode::Poll => tokio::spawn(poll::run(
            info_client.clone(),
            args.user_fills_limit,
            args.scan_interval,
            ev_tx,
            shutdown_rx.clone(),
        )),
    };
    let monitor_task = tokio::spawn(monitor.run(ev_rx, shutdown_rx.clone()));

    // ---- Status side task ----
    let status_task = tokio::spawn(status::run(
        info_client,
        executor,
        args.position_print_interval,
        shutdown_rx,
    ));

    // ---- Wait for Ctrl-C ----
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received, shutting down"),
        Err(e) => error!(error = %e, "signal handler failed, shutting down"),
    }
    let _ = shutdown_tx.send(true);

    for (name, task) in [("transport", transport_task), ("monitor", monitor_task), ("status", status_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task ended abnormally");
        }
    }
    // sender notice/recorder ikut drop bersama monitor -> worker selesai sendiri
    if timeout(Duration::from_secs(5), notifier_task).await.is_err() {
        warn!("notifier did not drain in time");
    }
    if let Some(t) = recorder_task {
        let _ = timeout(Duration::from_secs(5), t).await;
    }
    info!(opened = ?state.opened_subjects(), "stopped");
}
