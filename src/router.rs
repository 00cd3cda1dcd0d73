// ===============================
// src/router.rs (dispatcher account stream -> ledger / book / engine)
// ===============================
//
// Semua state dimiliki satu event loop (session); fungsi di sini dipanggil
// berurutan dari loop itu sehingga tidak perlu lock.
//
use serde_json::json;
use tracing::{error, info, warn};

use crate::balances::BalanceLedger;
use crate::console::format_number;
use crate::domain::{CounterOrderRequest, OrderStatusUpdate, StreamMessage};
use crate::metrics::{COUNTER_ORDERS, DECODE_ERRORS, FRAMES, UNKNOWN_FRAMES};
use crate::open_orders::OpenOrderBook;
use crate::recorder::{ActivityLog, LogType};
use crate::strategy::{CounterOrderEngine, FillDecision, SubmissionOutcome};

pub struct BotState {
    pub ledger: BalanceLedger,
    pub book: OpenOrderBook,
    pub engine: CounterOrderEngine,
    pub activity: ActivityLog,
}

impl BotState {
    pub fn new(ledger: BalanceLedger, book: OpenOrderBook, engine: CounterOrderEngine, activity: ActivityLog) -> Self {
        Self { ledger, book, engine, activity }
    }
}

/// Satu text frame: decode sekali, lalu dispatch. Frame rusak di-drop.
pub fn handle_frame(bot: &mut BotState, text: &str) {
    match StreamMessage::decode(text) {
        Ok(msg) => dispatch(bot, msg),
        Err(e) => {
            DECODE_ERRORS.inc();
            warn!(error = %e, "dropping undecodable frame");
            bot.activity.log(
                LogType::Error,
                format!("Failed to decode message: {e}"),
                Some(json!({ "raw": text })),
            );
        }
    }
}

pub fn dispatch(bot: &mut BotState, msg: StreamMessage) {
    FRAMES.with_label_values(&[msg.kind()]).inc();
    match msg {
        StreamMessage::Authenticated => info!("account stream authenticated"),
        StreamMessage::Pong
        | StreamMessage::OrderProcessed
        | StreamMessage::AccountTrade
        | StreamMessage::AccountHistory => {}
        StreamMessage::BalanceUpdate(ev) => {
            let b = bot.ledger.update_balance(ev);
            let message = format!("Balance Update - {}: {} available", b.symbol, b.available);
            let data = serde_json::to_value(b).ok();
            bot.activity.log(LogType::BalanceUpdate, message, data);
        }
        StreamMessage::OpenOrdersUpdate(orders) => {
            let data = serde_json::to_value(&orders).ok();
            bot.book.update_open_orders(orders);
            bot.activity.log(
                LogType::OpenOrdersUpdate,
                format!("Open Orders Update - {} orders", bot.book.list().len()),
                data,
            );
        }
        StreamMessage::OrderStatusUpdate(update) => handle_order_status(bot, update),
        StreamMessage::Unknown(kind) => {
            UNKNOWN_FRAMES.inc();
            warn!(%kind, "unknown account stream message type");
            bot.activity.log(LogType::Unknown, format!("Unknown message type: {kind}"), None);
        }
    }
}

fn handle_order_status(bot: &mut BotState, update: OrderStatusUpdate) {
    if update.is_filled() {
        bot.activity.log(LogType::OrderStatusUpdate, "Order Filled", serde_json::to_value(&update).ok());
    }
    let order_id = update.order_id.clone();
    match bot.engine.on_order_status(update) {
        FillDecision::Ignored | FillDecision::Submitted(_) => {}
        FillDecision::Duplicate => {
            bot.activity.log(
                LogType::OrderStatusUpdate,
                format!("Duplicate fill for {order_id}, counter order skipped"),
                None,
            );
        }
        FillDecision::Rejected(e) => {
            bot.activity.log(
                LogType::CounterOrderFailed,
                format!("Counter order not placed: {e}"),
                Some(json!({ "orderId": order_id })),
            );
        }
        FillDecision::DryRun(req) => {
            let reference = bot.ledger.reference_currency().to_string();
            bot.activity.log(
                LogType::CounterOrderPlaced,
                format!("[dry-run] {}", describe(&req, &reference)),
                Some(json!({ "orderDetails": req })),
            );
        }
    }
}

/// Dipanggil event loop saat task submit selesai.
pub fn on_submission(bot: &mut BotState, outcome: SubmissionOutcome) {
    let SubmissionOutcome { fill, request, result, elapsed } = outcome;
    let reference = bot.ledger.reference_currency().to_string();
    let details = json!({
        "side": request.side.as_str(),
        "quantity": request.quantity,
        "price": request.price,
        "notional": request.notional(),
        "currencyPair": request.pair,
        "customerOrderId": request.customer_order_id,
        "originalOrderId": fill.order_id,
        "originalOrderSide": fill.order_side,
        "originalOrderPrice": fill.executed_price,
        "originalOrderQuantity": fill.executed_quantity,
    });

    match result {
        Ok(ack) => {
            COUNTER_ORDERS.with_label_values(&["placed"]).inc();
            let message = describe(&request, &reference);
            info!(elapsed_ms = elapsed.as_millis() as u64, status = ack.status, order_id = ?ack.order_id, "{message}");
            bot.activity.log(
                LogType::CounterOrderPlaced,
                message,
                Some(json!({ "response": ack.raw, "orderDetails": details })),
            );
        }
        Err(e) => {
            COUNTER_ORDERS.with_label_values(&["failed"]).inc();
            error!(error = %e, pair = %request.pair, "counter order placement failed");
            bot.activity.log(
                LogType::CounterOrderFailed,
                "Counter order placement failed",
                Some(json!({ "error": e.to_string(), "orderDetails": details })),
            );
        }
    }
}

/// `Counter SELL 0.0001 BTCUSDT (9.3129 USDT) at 93,129`
pub fn describe(req: &CounterOrderRequest, reference: &str) -> String {
    let notional = req.notional();
    let unit = quote_label(&req.pair, reference);
    format!(
        "Counter {} {} {} ({}{}) at {}",
        req.side.as_str(),
        req.quantity,
        req.pair,
        format_number(&notional.to_string()),
        unit,
        format_number(&req.price.to_string()),
    )
}

// Notional hanya diberi label mata uang jika quote pair diketahui.
fn quote_label(pair: &str, reference: &str) -> String {
    const QUOTES: [&str; 5] = ["USDT", "USDC", "ZAR", "EUR", "BTC"];
    let pair = pair.to_ascii_uppercase();
    if !reference.is_empty() && pair.ends_with(&reference.to_ascii_uppercase()) {
        return format!(" {}", reference.to_ascii_uppercase());
    }
    QUOTES
        .iter()
        .find(|q| pair.ends_with(*q) && pair.len() > q.len())
        .map(|q| format!(" {q}"))
        .unwrap_or_default()
}
