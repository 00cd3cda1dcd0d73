// ===============================
// src/console.rs
// ===============================
//
// Perintah stdin (satu huruf per baris):
//   b        -> ringkasan portfolio
//   o        -> open orders per pair
//   l [tipe] -> activity log terakhir (opsional filter: placed, failed, unknown, ...)
// Lainnya -> bantuan. Semua view read-only atas state milik event loop.
//
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt::Write as _;
use std::io::BufRead;
use std::str::FromStr;
use std::thread;
use tokio::sync::mpsc;
use tracing::debug;

use crate::balances::PortfolioSummary;
use crate::open_orders::OpenOrderBook;
use crate::recorder::{ActivityLog, LogType};
use crate::router::BotState;

pub const HELP: &str = r#"Press "b" for balance summary, "o" for open orders, "l" for recent logs"#;
const RECENT_LOGS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Balances,
    OpenOrders,
    Logs(Option<LogType>),
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let line = line.trim().to_ascii_lowercase();
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("b"), None) => Command::Balances,
            (Some("o"), None) => Command::OpenOrders,
            (Some("l"), filter) => Command::Logs(filter.and_then(LogType::parse)),
            _ => Command::Help,
        }
    }
}

/// >= 1000 -> pemisah ribuan, maks 3 desimal. Selain itu string asli.
pub fn format_number(value: &str) -> String {
    let Ok(num) = Decimal::from_str(value.trim()) else {
        return value.to_string();
    };
    if num < Decimal::from(1000) {
        return value.to_string();
    }
    let rounded = num
        .round_dp_with_strategy(3, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
        .to_string();
    let (int_part, frac_part) = match rounded.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rounded.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3 + 4);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if let Some(f) = frac_part {
        grouped.push('.');
        grouped.push_str(f);
    }
    grouped
}

fn fixed2(d: Decimal) -> String {
    let mut v = d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    v.rescale(2);
    v.to_string()
}

pub fn render_summary(s: &PortfolioSummary) -> String {
    let refc = &s.reference_currency;
    let mut out = String::new();
    let _ = writeln!(out, "\n=== Portfolio Summary ===");
    let _ = writeln!(out, "Total Portfolio Value:    {:>8} {refc}", fixed2(s.total));
    let _ = writeln!(out, "Available Portfolio Value:{:>8} {refc}", fixed2(s.available));
    let _ = writeln!(out, "Reserved Value:           {:>8} {refc}", fixed2(s.reserved));
    let _ = writeln!(out);
    if s.rows.is_empty() {
        let _ = writeln!(out, "No balances with available funds");
    } else {
        let _ = writeln!(out, "=== Individual Balances ===");
        for row in &s.rows {
            let _ = writeln!(
                out,
                "{:<8} {:>25} | {:>8} {refc}",
                row.symbol,
                row.available.to_string(),
                fixed2(row.value)
            );
        }
    }
    let _ = writeln!(out, "========================");
    out
}

pub fn render_open_orders(book: &OpenOrderBook) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== Open Orders ({}) ===", book.len());
    if book.is_empty() {
        let _ = writeln!(out, "No open orders");
    }
    for (pair, orders) in book.grouped_by_pair() {
        let _ = writeln!(out, "{pair}");
        for o in orders {
            let _ = writeln!(
                out,
                "  {:<4} {:>14} @ {:>14}  {}",
                o.side.as_str(),
                o.quantity.to_string(),
                format_number(&o.price.to_string()),
                o.order_id
            );
        }
    }
    let _ = writeln!(out, "==================");
    out
}

pub fn render_logs(log: &ActivityLog, count: usize, kind: Option<LogType>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== Recent Logs ===");
    let entries = log.recent(count, kind);
    if entries.is_empty() {
        let _ = writeln!(out, "No logs available");
    }
    for e in entries {
        let _ = writeln!(out, "[{}] {}: {}", e.timestamp.format("%H:%M:%S"), e.kind.as_str(), e.message);
    }
    let _ = writeln!(out, "==================");
    out
}

pub fn render(cmd: Command, bot: &BotState) -> String {
    match cmd {
        Command::Balances => {
            let mut out = render_summary(&bot.ledger.summary());
            match bot.ledger.last_update() {
                Some(t) => {
                    let _ = writeln!(out, "Last update: {} ({} assets)", t.format("%H:%M:%S"), bot.ledger.len());
                }
                None => {
                    let _ = writeln!(out, "No balance updates received yet");
                }
            }
            out
        }
        Command::OpenOrders => render_open_orders(&bot.book),
        Command::Logs(kind) => render_logs(&bot.activity, RECENT_LOGS, kind),
        Command::Help => format!("{HELP}\n"),
    }
}

pub fn execute(cmd: Command, bot: &BotState) {
    print!("{}", render(cmd, bot));
}

/// Reader stdin di OS thread sendiri (blocking read), selesai saat receiver di-drop.
pub fn spawn_reader(tx: mpsc::Sender<Command>) {
    println!("{HELP}");
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(Command::parse(&line)).is_err() {
                break;
            }
        }
        debug!("console reader stopped");
    });
}
