// ===============================
// src/recorder.rs
// ===============================
//
// Activity log bot:
// - Ring buffer in-memory (MAX_LOGS entry terakhir) untuk view "l" di console.
// - Opsional: mirror ke file .jsonl (append) lewat task terpisah.
//   Bufer BufWriter, flush tiap 1s dan/atau tiap 1000 entry.
//
// ENV: set `RECORD_FILE=/path/to/activity.jsonl` agar mirror aktif.
//
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info};

pub const MAX_LOGS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    Ping,
    BalanceUpdate,
    OpenOrdersUpdate,
    OrderStatusUpdate,
    CounterOrderPlaced,
    CounterOrderFailed,
    Unknown,
    Error,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Ping => "PING",
            LogType::BalanceUpdate => "BALANCE_UPDATE",
            LogType::OpenOrdersUpdate => "OPEN_ORDERS_UPDATE",
            LogType::OrderStatusUpdate => "ORDER_STATUS_UPDATE",
            LogType::CounterOrderPlaced => "COUNTER_ORDER_PLACED",
            LogType::CounterOrderFailed => "COUNTER_ORDER_FAILED",
            LogType::Unknown => "UNKNOWN",
            LogType::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<LogType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Some(LogType::Ping),
            "balance" | "balance_update" => Some(LogType::BalanceUpdate),
            "orders" | "open_orders_update" => Some(LogType::OpenOrdersUpdate),
            "status" | "order_status_update" => Some(LogType::OrderStatusUpdate),
            "placed" | "counter_order_placed" => Some(LogType::CounterOrderPlaced),
            "failed" | "counter_order_failed" => Some(LogType::CounterOrderFailed),
            "unknown" => Some(LogType::Unknown),
            "error" => Some(LogType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub struct ActivityLog {
    entries: VecDeque<LogEntry>,
    cap: usize,
    sink: Option<mpsc::Sender<LogEntry>>,
}

impl ActivityLog {
    pub fn new(cap: usize) -> Self {
        Self { entries: VecDeque::with_capacity(cap.min(MAX_LOGS)), cap: cap.max(1), sink: None }
    }

    pub fn with_sink(mut self, sink: mpsc::Sender<LogEntry>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn log(&mut self, kind: LogType, message: impl Into<String>, data: Option<serde_json::Value>) {
        let entry = LogEntry { timestamp: Utc::now(), kind, message: message.into(), data };
        debug!(log_type = ?entry.kind, msg = %entry.message, "activity");

        if let Some(tx) = &self.sink {
            // jangan blok event loop: drop jika writer tertinggal
            if tx.try_send(entry.clone()).is_err() {
                debug!("recorder: sink full/closed, entry not mirrored");
            }
        }

        self.entries.push_back(entry);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    /// `count` entry terakhir (urut kronologis), opsional difilter per tipe.
    pub fn recent(&self, count: usize, kind: Option<LogType>) -> Vec<&LogEntry> {
        let mut out: Vec<&LogEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(count)
            .collect();
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(MAX_LOGS)
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<LogEntry>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, JSONL mirror disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_entry = rx.recv() => {
                let Some(entry) = maybe_entry else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&entry) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip entry");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop entry");
                                continue;
                            }
                        }
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, stopping");
                            break;
                        }
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
