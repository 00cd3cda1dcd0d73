// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Account stream --------
pub static FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stream_frames_total", "decoded account stream frames by type"),
        &["type"],
    )
    .unwrap()
});

pub static UNKNOWN_FRAMES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("stream_unknown_frames_total", "frames with unrecognized type").unwrap()
});

pub static DECODE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("stream_decode_errors_total", "frames dropped on decode failure").unwrap()
});

pub static HEARTBEATS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stream_heartbeats_total", "PING frames sent").unwrap());

// 0 disconnected, 1 connecting, 2 open, 3 closing
pub static SESSION_STATE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("session_state", "account stream session state").unwrap());

pub static RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("session_reconnects_total", "reconnect attempts to account stream").unwrap()
});

// -------- Counter orders --------
pub static COUNTER_ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("counter_orders_total", "counter orders by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static COUNTER_SUBMIT_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "counter_order_submit_ms",
        "Latency of counter order REST submission (ms)",
    ))
    .unwrap()
});

// -------- State trackers --------
pub static BALANCES_TRACKED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("balances_tracked", "assets in balance ledger").unwrap());

pub static OPEN_ORDERS_TRACKED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_orders_tracked", "orders in latest snapshot").unwrap());

pub static PORTFOLIO_TOTAL: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("portfolio_total_in_reference", "total portfolio value (reference currency)").unwrap()
});

pub static PORTFOLIO_AVAILABLE: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "portfolio_available_in_reference",
        "available portfolio value (reference currency)",
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(FRAMES.clone())),
        REGISTRY.register(Box::new(UNKNOWN_FRAMES.clone())),
        REGISTRY.register(Box::new(DECODE_ERRORS.clone())),
        REGISTRY.register(Box::new(HEARTBEATS.clone())),
        REGISTRY.register(Box::new(SESSION_STATE.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(COUNTER_ORDERS.clone())),
        REGISTRY.register(Box::new(COUNTER_SUBMIT_MS.clone())),
        REGISTRY.register(Box::new(BALANCES_TRACKED.clone())),
        REGISTRY.register(Box::new(OPEN_ORDERS_TRACKED.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_TOTAL.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_AVAILABLE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Metrics server di OS thread terpisah; port 0 = nonaktif.
pub fn serve_metrics(port: u16) {
    if port == 0 {
        return;
    }
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed, metrics endpoint disabled");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
