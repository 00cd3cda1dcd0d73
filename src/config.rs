// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : valr_grid_bot — async VALR grid trading client in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Streams the VALR account WebSocket, tracks balances and open
          orders, and answers every filled order with a mirrored counter
          order at a fixed price offset (grid ladder). Exposes Prometheus
          metrics and records the activity log as JSONL.
=============================================================================
*/
use ahash::AHashMap as HashMap;
use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::valr::Credentials;

pub const DEFAULT_WS_URL: &str = "wss://api.valr.com/ws/account";
pub const DEFAULT_REST_URL: &str = "https://api.valr.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required {0} environment variable")]
    MissingVar(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Flag CLI; menimpa nilai dari ENV.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "valr_grid_bot", version, about = "VALR grid trading bot (counter orders on fills)")]
pub struct Cli {
    /// Hitung & log counter order tanpa mengirim ke exchange
    #[arg(long)]
    pub dry_run: bool,
    /// Jangan reconnect saat stream tertutup
    #[arg(long)]
    pub no_reconnect: bool,
    /// Matikan pembaca perintah stdin (b / o / l)
    #[arg(long)]
    pub no_console: bool,
    #[arg(long)]
    pub metrics_port: Option<u16>,
    #[arg(long)]
    pub record_file: Option<String>,
}

/// Jumlah desimal harga per pair. Pair yang tidak terdaftar pakai `default_dp`.
#[derive(Debug, Clone, Default)]
pub struct PriceResolution {
    default_dp: u32,
    per_pair: HashMap<String, u32>,
}

impl PriceResolution {
    pub fn new(default_dp: u32) -> Self {
        Self { default_dp, per_pair: HashMap::new() }
    }

    pub fn with_pair(mut self, pair: &str, dp: u32) -> Self {
        self.per_pair.insert(pair.trim().to_ascii_uppercase(), dp);
        self
    }

    /// Format: `BTCZAR:0,ETHZAR:0,XRPZAR:4`
    pub fn parse(table: &str, default_dp: u32) -> Result<Self, ConfigError> {
        let mut out = Self::new(default_dp);
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || ConfigError::Invalid { key: "PRICE_DECIMALS", value: entry.to_string() };
            let (pair, dp) = entry.split_once(':').ok_or_else(invalid)?;
            let dp: u32 = dp.trim().parse().map_err(|_| invalid())?;
            if pair.trim().is_empty() || dp > 28 {
                return Err(invalid());
            }
            out = out.with_pair(pair, dp);
        }
        Ok(out)
    }

    pub fn decimals_for(&self, pair: &str) -> u32 {
        self.per_pair
            .get(&pair.to_ascii_uppercase())
            .copied()
            .unwrap_or(self.default_dp)
    }
}

#[derive(Debug, Clone)]
pub struct SessionCfg {
    pub ws_url: String,
    pub heartbeat: Duration,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32, // 0 = tanpa batas
}

#[derive(Debug, Clone)]
pub struct StrategyCfg {
    pub offset: Decimal,
    pub price_resolution: PriceResolution,
    pub dedup_capacity: usize,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct Config {
    pub credentials: Credentials,
    pub rest_url: String,
    pub reference_currency: String,
    pub order_timeout: Duration,
    pub metrics_port: u16,
    pub record_file: Option<String>,
    pub console: bool,
    pub session: SessionCfg,
    pub strategy: StrategyCfg,
}

pub fn load() -> Result<Config, ConfigError> {
    // Pastikan .env dibaca sebelum cek kredensial
    let _ = dotenv();
    let cli = Cli::parse();
    from_source(&cli, |k| env::var(k).ok())
}

fn flag(v: Option<String>, default: bool) -> bool {
    match v.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if matches!(s.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(s) if matches!(s.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn num<T: FromStr>(v: Option<String>, default: T) -> T {
    v.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Bangun Config dari sumber key/value (ENV saat runtime, map saat test).
pub fn from_source<F>(cli: &Cli, get: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // ===== Kredensial (wajib, dicek sekali di startup) =====
    let api_key = get("VALR_API_KEY")
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::MissingVar("VALR_API_KEY"))?;
    let api_secret = get("VALR_API_SECRET")
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::MissingVar("VALR_API_SECRET"))?;

    // ===== Endpoint =====
    let ws_url = get("VALR_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());
    let rest_url = get("VALR_REST_URL").unwrap_or_else(|| DEFAULT_REST_URL.to_string());

    // ===== Strategy =====
    let offset = match get("COUNTER_OFFSET") {
        Some(raw) => {
            let invalid = || ConfigError::Invalid { key: "COUNTER_OFFSET", value: raw.clone() };
            let v = Decimal::from_str(raw.trim()).map_err(|_| invalid())?;
            if v.is_sign_negative() || v >= Decimal::ONE {
                return Err(invalid());
            }
            v
        }
        None => Decimal::new(25, 4), // 0.25%
    };
    let default_dp = num(get("DEFAULT_PRICE_DECIMALS"), 0u32);
    let price_resolution = PriceResolution::parse(&get("PRICE_DECIMALS").unwrap_or_default(), default_dp)?;
    let dedup_capacity = num(get("FILL_DEDUP_CAPACITY"), 1024usize);

    // ===== Session =====
    let heartbeat = Duration::from_secs(num(get("HEARTBEAT_SECS"), 30u64).max(1));
    let reconnect = !cli.no_reconnect && flag(get("RECONNECT"), true);
    let max_reconnect_attempts = num(get("MAX_RECONNECT_ATTEMPTS"), 0u32);

    // ===== Misc =====
    let reference_currency = get("REFERENCE_CURRENCY")
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "USDC".to_string());
    let order_timeout = Duration::from_secs(num(get("ORDER_TIMEOUT_SECS"), 10u64).max(1));
    let metrics_port = cli.metrics_port.unwrap_or_else(|| num(get("METRICS_PORT"), 9898u16));
    let record_file = cli.record_file.clone().or_else(|| get("RECORD_FILE"));

    Ok(Config {
        credentials: Credentials::new(api_key, api_secret),
        rest_url,
        reference_currency,
        order_timeout,
        metrics_port,
        record_file,
        console: !cli.no_console,
        session: SessionCfg { ws_url, heartbeat, reconnect, max_reconnect_attempts },
        strategy: StrategyCfg { offset, price_resolution, dedup_capacity, dry_run: cli.dry_run },
    })
}
