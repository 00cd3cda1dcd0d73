// ===============================
// src/main.rs
// ===============================
/*
 # jalankan (kredensial dari .env / ENV)
 RUST_LOG=info cargo run --release -- --dry-run

 # metrics
 curl -s localhost:9898/metrics | egrep '^(session_state|counter_orders_total|stream_frames_total)'
*/
/*
=============================================================================
Project : valr_grid_bot — async VALR grid trading client in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Streams the VALR account WebSocket, tracks balances and open
          orders, and answers every filled order with a mirrored counter
          order at a fixed price offset (grid ladder). Exposes Prometheus
          metrics and records the activity log as JSONL.
=============================================================================
*/
mod balances;
mod config;
mod console;
mod domain;
mod gateway_valr;   // REST: POST /v1/orders/limit
mod metrics;
mod open_orders;
mod recorder;
mod router;         // dispatcher stream -> ledger / book / engine
mod session;        // WS account stream + reconnect + heartbeat
mod strategy;       // counter order (grid)
mod valr;           // signer HMAC-SHA512

use std::process;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::balances::BalanceLedger;
use crate::gateway_valr::ValrRest;
use crate::open_orders::OpenOrderBook;
use crate::recorder::{ActivityLog, LogEntry, MAX_LOGS};
use crate::router::BotState;
use crate::session::{LoopIo, SessionController};
use crate::strategy::{CounterOrderEngine, SubmissionOutcome};
use crate::valr::Signer;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("VALR Grid Trading Bot starting up...");

    // ---- Config (kredensial wajib dicek sekali di sini) ----
    let cfg = match config::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            process::exit(1);
        }
    };

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(cfg.metrics_port);

    info!(
        ws = %cfg.session.ws_url,
        rest = %cfg.rest_url,
        reference = %cfg.reference_currency,
        offset = %cfg.strategy.offset,
        heartbeat_s = cfg.session.heartbeat.as_secs(),
        reconnect = cfg.session.reconnect,
        dry_run = cfg.strategy.dry_run,
        metrics_port = cfg.metrics_port,
        "startup config"
    );
    if cfg.strategy.dry_run {
        warn!("dry-run: counter orders are logged, not sent");
    }

    let config::Config {
        credentials,
        rest_url,
        reference_currency,
        order_timeout,
        record_file,
        console: console_enabled,
        session: session_cfg,
        strategy: strategy_cfg,
        ..
    } = cfg;

    let signer = Arc::new(Signer::new(credentials));
    let rest = match ValrRest::new(&rest_url, order_timeout) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "http client init failed");
            process::exit(1);
        }
    };

    // ---- Activity log (+ JSONL mirror opsional) ----
    let mut activity = ActivityLog::new(MAX_LOGS);
    let mut recorder_task = None;
    if let Some(path) = record_file {
        let (rec_tx, rec_rx) = mpsc::channel::<LogEntry>(8192);
        recorder_task = Some(tokio::spawn(recorder::run(rec_rx, path)));
        activity = activity.with_sink(rec_tx);
    }

    // ---- Engine + state (dimiliki event loop session) ----
    let (outcome_tx, outcome_rx) = mpsc::channel::<SubmissionOutcome>(1024);
    let engine = CounterOrderEngine::new(strategy_cfg, signer.clone(), rest, outcome_tx);
    let mut bot = BotState::new(
        BalanceLedger::new(reference_currency),
        OpenOrderBook::new(),
        engine,
        activity,
    );

    // ---- Shutdown (Ctrl-C) ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, closing session");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    // ---- Console ----
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    if console_enabled {
        console::spawn_reader(cmd_tx);
    } else {
        drop(cmd_tx);
    }

    // ---- Session ----
    let mut io = LoopIo::new(outcome_rx, cmd_rx, shutdown_rx);
    let (mut session, _state_rx) = SessionController::new(session_cfg, signer);
    session.run(&mut bot, &mut io).await;

    // session selesai permanen -> tutup loop console
    drop(io);
    let _ = shutdown_tx.send(true);
    info!(logs = bot.activity.len(), "bot stopped");

    // sink ikut di-drop -> recorder flush & selesai
    drop(bot);
    if let Some(task) = recorder_task {
        if tokio::time::timeout(Duration::from_secs(3), task).await.is_err() {
            warn!("recorder did not finish flushing in time");
        }
    }
}
