// ===============================
// src/strategy.rs
// ===============================
//
// Grid counter-order:
//   fill BUY  di P -> SELL qty sama di round(P × (1 + f))
//   fill SELL di P -> BUY  qty sama di round(P × (1 − f))
//
// Perhitungan harga murni (tanpa I/O) ada di `counter_price` / `plan_counter_order`.
// `CounterOrderEngine` menambah guard duplikat, sign, lalu submit di task terpisah;
// hasil submit dikirim balik ke event loop lewat channel (`SubmissionOutcome`).
//
use ahash::AHashSet as HashSet;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StrategyCfg;
use crate::domain::{CounterOrderRequest, OrderStatusUpdate, Side, TIME_IN_FORCE_GTC};
use crate::gateway_valr::{GatewayError, OrderAck, SignedOrder, ValrRest};
use crate::metrics::{COUNTER_ORDERS, COUNTER_SUBMIT_MS};
use crate::valr::{Signer, LIMIT_ORDER_PATH};

// customerOrderId VALR: alfanumerik + '-', max 50 char
const CUSTOMER_ORDER_ID_MAX: usize = 50;
const CUSTOMER_ORDER_ID_PREFIX: &str = "ctr-";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StrategyError {
    #[error("unknown order side {0:?}")]
    UnknownSide(String),
    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("decimal overflow computing counter price")]
    Overflow,
    #[error("serialize order body: {0}")]
    Serialize(String),
}

fn parse_positive(field: &'static str, raw: &str) -> Result<Decimal, StrategyError> {
    let invalid = || StrategyError::InvalidNumber { field, value: raw.to_string() };
    let v = Decimal::from_str(raw.trim()).map_err(|_| invalid())?;
    if v <= Decimal::ZERO {
        return Err(invalid());
    }
    Ok(v)
}

/// Harga counter dari harga eksekusi `executed` untuk fill di sisi `filled_side`.
/// Pembulatan half-away-from-zero ke `dp` desimal.
pub fn counter_price(
    executed: Decimal,
    filled_side: Side,
    offset: Decimal,
    dp: u32,
) -> Result<Decimal, StrategyError> {
    let factor = match filled_side {
        Side::Buy => Decimal::ONE.checked_add(offset),
        Side::Sell => Decimal::ONE.checked_sub(offset),
    }
    .ok_or(StrategyError::Overflow)?;
    let raw = executed.checked_mul(factor).ok_or(StrategyError::Overflow)?;
    Ok(raw
        .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
        .normalize())
}

pub fn customer_order_id(order_id: &str) -> String {
    let mut id = String::with_capacity(CUSTOMER_ORDER_ID_MAX);
    id.push_str(CUSTOMER_ORDER_ID_PREFIX);
    id.extend(
        order_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(CUSTOMER_ORDER_ID_MAX - CUSTOMER_ORDER_ID_PREFIX.len()),
    );
    id
}

/// `Ok(None)` jika update bukan "Filled".
pub fn plan_counter_order(
    fill: &OrderStatusUpdate,
    cfg: &StrategyCfg,
) -> Result<Option<CounterOrderRequest>, StrategyError> {
    if !fill.is_filled() {
        return Ok(None);
    }
    let filled_side =
        Side::parse(&fill.order_side).ok_or_else(|| StrategyError::UnknownSide(fill.order_side.clone()))?;
    let executed_price = parse_positive("executedPrice", &fill.executed_price)?;
    let quantity = parse_positive("executedQuantity", &fill.executed_quantity)?.normalize();

    let dp = cfg.price_resolution.decimals_for(&fill.currency_pair);
    let price = counter_price(executed_price, filled_side, cfg.offset, dp)?;
    if price <= Decimal::ZERO {
        return Err(StrategyError::InvalidNumber { field: "counterPrice", value: price.to_string() });
    }

    Ok(Some(CounterOrderRequest {
        side: filled_side.opposite(),
        quantity,
        price,
        pair: fill.currency_pair.clone(),
        post_only: false,
        time_in_force: TIME_IN_FORCE_GTC,
        allow_margin: false,
        customer_order_id: customer_order_id(&fill.order_id),
    }))
}

#[derive(Debug)]
pub enum FillDecision {
    Ignored,
    Duplicate,
    Rejected(StrategyError),
    DryRun(CounterOrderRequest),
    Submitted(CounterOrderRequest),
}

/// Hasil satu submit; urutan selesai tidak sama dengan urutan fill.
#[derive(Debug)]
pub struct SubmissionOutcome {
    pub fill: OrderStatusUpdate,
    pub request: CounterOrderRequest,
    pub result: Result<OrderAck, GatewayError>,
    pub elapsed: Duration,
}

pub struct CounterOrderEngine {
    cfg: StrategyCfg,
    signer: Arc<Signer>,
    rest: ValrRest,
    outcome_tx: mpsc::Sender<SubmissionOutcome>,
    // guard orderId yang sudah di-counter (FIFO terbatas)
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
}

impl CounterOrderEngine {
    pub fn new(
        cfg: StrategyCfg,
        signer: Arc<Signer>,
        rest: ValrRest,
        outcome_tx: mpsc::Sender<SubmissionOutcome>,
    ) -> Self {
        let cap = cfg.dedup_capacity;
        Self {
            cfg,
            signer,
            rest,
            outcome_tx,
            seen_order: VecDeque::with_capacity(cap),
            seen: HashSet::with_capacity(cap),
        }
    }

    fn already_countered(&self, order_id: &str) -> bool {
        self.cfg.dedup_capacity > 0 && self.seen.contains(order_id)
    }

    fn remember(&mut self, order_id: &str) {
        if self.cfg.dedup_capacity == 0 {
            return;
        }
        if self.seen.insert(order_id.to_string()) {
            self.seen_order.push_back(order_id.to_string());
        }
        while self.seen_order.len() > self.cfg.dedup_capacity {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    /// Dipanggil dari event loop untuk setiap ORDER_STATUS_UPDATE.
    /// Tidak pernah menunggu jaringan: submit berjalan di task sendiri.
    pub fn on_order_status(&mut self, fill: OrderStatusUpdate) -> FillDecision {
        if !fill.is_filled() {
            return FillDecision::Ignored;
        }
        if self.already_countered(&fill.order_id) {
            COUNTER_ORDERS.with_label_values(&["duplicate"]).inc();
            debug!(order_id = %fill.order_id, "duplicate fill, counter order skipped");
            return FillDecision::Duplicate;
        }

        let request = match plan_counter_order(&fill, &self.cfg) {
            Ok(Some(r)) => r,
            Ok(None) => return FillDecision::Ignored,
            Err(e) => {
                COUNTER_ORDERS.with_label_values(&["rejected"]).inc();
                warn!(order_id = %fill.order_id, error = %e, "counter order not planned");
                return FillDecision::Rejected(e);
            }
        };

        if self.cfg.dry_run {
            self.remember(&fill.order_id);
            COUNTER_ORDERS.with_label_values(&["dry_run"]).inc();
            info!(
                side = request.side.as_str(),
                qty = %request.quantity,
                price = %request.price,
                pair = %request.pair,
                "dry-run counter order (not sent)"
            );
            return FillDecision::DryRun(request);
        }

        let body = match serde_json::to_string(&request) {
            Ok(b) => b,
            Err(e) => {
                COUNTER_ORDERS.with_label_values(&["rejected"]).inc();
                return FillDecision::Rejected(StrategyError::Serialize(e.to_string()));
            }
        };
        let headers = self.signer.build_headers(LIMIT_ORDER_PATH, &body, "POST");
        self.remember(&fill.order_id);
        COUNTER_ORDERS.with_label_values(&["submitted"]).inc();
        info!(
            order_id = %fill.order_id,
            side = request.side.as_str(),
            qty = %request.quantity,
            price = %request.price,
            pair = %request.pair,
            "submitting counter order"
        );

        let signed = SignedOrder { request: request.clone(), body, headers };
        let rest = self.rest.clone();
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = rest.place_limit_order(&signed).await;
            let elapsed = started.elapsed();
            COUNTER_SUBMIT_MS.observe(elapsed.as_secs_f64() * 1000.0);
            let outcome = SubmissionOutcome { fill, request: signed.request, result, elapsed };
            if tx.send(outcome).await.is_err() {
                debug!("event loop gone, submission outcome dropped");
            }
        });

        FillDecision::Submitted(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceResolution;
    use crate::valr::{sign_request, Credentials};
    use httpmock::prelude::*;
    use rust_decimal_macros::dec;

    const SECRET: &str = "test-secret";
    const FIXED_TS: u64 = 1_700_000_000_000;

    fn cfg() -> StrategyCfg {
        StrategyCfg {
            offset: dec!(0.0025),
            price_resolution: PriceResolution::new(0),
            dedup_capacity: 1024,
            dry_run: false,
        }
    }

    fn fill(id: &str, status: &str, side: &str, price: &str, qty: &str) -> OrderStatusUpdate {
        OrderStatusUpdate {
            order_id: id.into(),
            order_status_type: status.into(),
            currency_pair: "BTCUSDT".into(),
            order_side: side.into(),
            executed_price: price.into(),
            executed_quantity: qty.into(),
            ..OrderStatusUpdate::default()
        }
    }

    fn engine(
        base_url: &str,
        cfg: StrategyCfg,
        timeout: Duration,
    ) -> (CounterOrderEngine, mpsc::Receiver<SubmissionOutcome>) {
        let signer = Signer::new(Credentials::new("key".into(), SECRET.into())).with_clock(|| FIXED_TS);
        let rest = ValrRest::new(base_url, timeout).unwrap();
        let (tx, rx) = mpsc::channel(8);
        (CounterOrderEngine::new(cfg, Arc::new(signer), rest, tx), rx)
    }

    #[test]
    fn buy_fill_counters_with_sell_above() {
        let req = plan_counter_order(&fill("1", "Filled", "buy", "100", "0.5"), &cfg()).unwrap().unwrap();
        assert_eq!(req.side, Side::Sell);
        // 100.25 -> 0 dp
        assert_eq!(req.price, dec!(100));
        assert_eq!(req.quantity, dec!(0.5));
        assert_eq!(req.time_in_force, "GTC");
        assert!(!req.post_only && !req.allow_margin);
    }

    #[test]
    fn sell_fill_counters_with_buy_below() {
        let req = plan_counter_order(&fill("2", "Filled", "sell", "40000", "0.01"), &cfg()).unwrap().unwrap();
        assert_eq!(req.side, Side::Buy);
        assert_eq!(req.price, dec!(39900));
    }

    #[test]
    fn rounds_half_away_from_zero_per_pair() {
        assert_eq!(counter_price(dec!(200), Side::Buy, dec!(0.0025), 0).unwrap(), dec!(201));
        assert_eq!(counter_price(dec!(92897), Side::Buy, dec!(0.0025), 0).unwrap(), dec!(93129));
        let mut c = cfg();
        c.price_resolution = PriceResolution::new(0).with_pair("XRPUSDT", 4);
        let mut f = fill("3", "Filled", "buy", "0.5", "10");
        f.currency_pair = "XRPUSDT".into();
        let req = plan_counter_order(&f, &c).unwrap().unwrap();
        assert_eq!(req.price, dec!(0.5013));
    }

    #[test]
    fn quantity_is_executed_quantity() {
        let req = plan_counter_order(&fill("4", "Filled", "buy", "50000", "0.00010000"), &cfg())
            .unwrap()
            .unwrap();
        assert_eq!(req.quantity.to_string(), "0.0001");
    }

    #[test]
    fn non_filled_is_ignored() {
        for status in ["Placed", "Partially Filled", "Cancelled", "Failed", "filled"] {
            assert_eq!(plan_counter_order(&fill("5", status, "buy", "100", "1"), &cfg()).unwrap(), None);
        }
    }

    #[test]
    fn unknown_side_and_bad_numbers_error() {
        assert_eq!(
            plan_counter_order(&fill("6", "Filled", "hold", "100", "1"), &cfg()).unwrap_err(),
            StrategyError::UnknownSide("hold".into())
        );
        assert!(matches!(
            plan_counter_order(&fill("7", "Filled", "buy", "abc", "1"), &cfg()).unwrap_err(),
            StrategyError::InvalidNumber { field: "executedPrice", .. }
        ));
        assert!(matches!(
            plan_counter_order(&fill("8", "Filled", "buy", "100", "0"), &cfg()).unwrap_err(),
            StrategyError::InvalidNumber { field: "executedQuantity", .. }
        ));
    }

    #[test]
    fn customer_order_id_is_sanitized_and_bounded() {
        assert_eq!(customer_order_id("0198-ab_cd"), "ctr-0198-abcd");
        let long = "a".repeat(80);
        assert_eq!(customer_order_id(&long).len(), 50);
    }

    #[tokio::test]
    async fn filled_update_posts_signed_counter_order() {
        let server = MockServer::start_async().await;
        let expected_body = r#"{"side":"SELL","quantity":"0.0001","price":"93129","pair":"BTCUSDT","postOnly":false,"timeInForce":"GTC","allowMargin":false,"customerOrderId":"ctr-abc-1"}"#;
        let expected_sig = sign_request(SECRET, FIXED_TS, "POST", LIMIT_ORDER_PATH, expected_body);
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(LIMIT_ORDER_PATH)
                    .header("content-type", "application/json")
                    .header("x-valr-api-key", "key")
                    .header("x-valr-signature", expected_sig.as_str())
                    .header("x-valr-timestamp", FIXED_TS.to_string())
                    .body(expected_body);
                then.status(202).json_body(serde_json::json!({"id": "558f5e0a-ffd1"}));
            })
            .await;

        let (mut eng, mut rx) = engine(&server.base_url(), cfg(), Duration::from_secs(5));
        let decision = eng.on_order_status(fill("abc-1", "Filled", "buy", "92897", "0.0001"));
        assert!(matches!(decision, FillDecision::Submitted(ref r) if r.price == dec!(93129)));

        let outcome = rx.recv().await.unwrap();
        let ack = outcome.result.unwrap();
        assert_eq!(ack.status, 202);
        assert_eq!(ack.order_id.as_deref(), Some("558f5e0a-ffd1"));
        assert_eq!(outcome.request.notional(), dec!(9.3129));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_filled_update_sends_nothing() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(LIMIT_ORDER_PATH);
                then.status(202);
            })
            .await;
        let (mut eng, _rx) = engine(&server.base_url(), cfg(), Duration::from_secs(5));
        for status in ["Placed", "Partially Filled", "Cancelled"] {
            assert!(matches!(eng.on_order_status(fill("x", status, "buy", "100", "1")), FillDecision::Ignored));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.hits_async().await, 0);
    }

    #[tokio::test]
    async fn rejection_is_reported_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(LIMIT_ORDER_PATH);
                then.status(400).body(r#"{"code":-1,"message":"Insufficient Balance"}"#);
            })
            .await;
        let (mut eng, mut rx) = engine(&server.base_url(), cfg(), Duration::from_secs(5));
        eng.on_order_status(fill("r1", "Filled", "sell", "40000", "0.01"));

        let outcome = rx.recv().await.unwrap();
        match outcome.result {
            Err(GatewayError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("Insufficient Balance"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn slow_exchange_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(LIMIT_ORDER_PATH);
                then.status(202).delay(Duration::from_millis(800));
            })
            .await;
        let (mut eng, mut rx) = engine(&server.base_url(), cfg(), Duration::from_millis(100));
        eng.on_order_status(fill("t1", "Filled", "buy", "100", "1"));

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(GatewayError::Timeout(_))));
    }

    #[tokio::test]
    async fn duplicate_fill_is_countered_once() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(LIMIT_ORDER_PATH);
                then.status(202).json_body(serde_json::json!({"id": "x"}));
            })
            .await;
        let (mut eng, mut rx) = engine(&server.base_url(), cfg(), Duration::from_secs(5));
        let f = fill("dup-1", "Filled", "buy", "100", "1");
        assert!(matches!(eng.on_order_status(f.clone()), FillDecision::Submitted(_)));
        assert!(matches!(eng.on_order_status(f), FillDecision::Duplicate));

        rx.recv().await.unwrap().result.unwrap();
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn dry_run_plans_without_sending() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(LIMIT_ORDER_PATH);
                then.status(202);
            })
            .await;
        let mut c = cfg();
        c.dry_run = true;
        let (mut eng, _rx) = engine(&server.base_url(), c, Duration::from_secs(5));
        let decision = eng.on_order_status(fill("d1", "Filled", "sell", "40000", "0.01"));
        assert!(matches!(decision, FillDecision::DryRun(ref r) if r.side == Side::Buy));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.hits_async().await, 0);
    }

    #[test]
    fn dedup_guard_is_bounded() {
        let rest = ValrRest::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let signer = Arc::new(Signer::new(Credentials::new("k".into(), "s".into())));
        let (tx, _rx) = mpsc::channel(1);
        let mut c = cfg();
        c.dedup_capacity = 2;
        let mut eng = CounterOrderEngine::new(c, signer, rest, tx);
        eng.remember("a");
        eng.remember("b");
        eng.remember("c");
        assert!(!eng.already_countered("a"));
        assert!(eng.already_countered("b") && eng.already_countered("c"));
    }
}
