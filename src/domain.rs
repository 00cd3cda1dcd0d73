// ===============================
// src/domain.rs
// ===============================
//
// Wire & domain types untuk VALR account stream + REST order.
// Semua angka di wire berupa string desimal -> rust_decimal::Decimal.
//
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const ORDER_STATUS_FILLED: &str = "Filled";
pub const TIME_IN_FORCE_GTC: &str = "GTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "buy")]
    Buy,
    #[serde(alias = "sell")]
    Sell,
}

impl Side {
    /// Parse side dari stream (`buy` / `sell`, case-insensitive).
    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
    pub fn opposite(self) -> Side {
        match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Side::Buy => "BUY", Side::Sell => "SELL" }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Currency {
    pub symbol: String,
    #[serde(default)] pub decimal_places: u32,
    #[serde(default)] pub short_name: String,
    #[serde(default)] pub long_name: String,
}

// ---- BALANCE_UPDATE ----
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdate {
    pub currency: Currency,
    pub available: Decimal,
    #[serde(default)] pub reserved: Decimal,
    pub total: Decimal,
    #[serde(default)] pub updated_at: String,
    #[serde(default)] pub reference_currency: String,
    #[serde(default)] pub total_in_reference: Decimal,
}

/// Balance per aset; `available_in_reference` diturunkan, bukan dari wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub symbol: String,
    pub available: Decimal,
    pub reserved: Decimal,
    pub total: Decimal,
    pub updated_at: String,
    pub currency: Currency,
    pub reference_currency: String,
    pub total_in_reference: Decimal,
    pub available_in_reference: Decimal,
}

// ---- OPEN_ORDERS_UPDATE ----
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub currency_pair: String,
    #[serde(default)] pub status: String,
    #[serde(default)] pub time_in_force: String,
    #[serde(default)] pub original_quantity: String,
    #[serde(default)] pub filled_percentage: String,
    #[serde(rename = "type", default)] pub order_type: String,
    #[serde(default)] pub created_at: String,
    #[serde(default)] pub updated_at: String,
    #[serde(default)] pub allow_margin: bool,
}

// ---- ORDER_STATUS_UPDATE ----
// Side & angka dibiarkan String: validasi terjadi di strategy (bukan di decoder),
// supaya update non-Filled dengan field kosong tidak menjatuhkan frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusUpdate {
    pub order_id: String,
    pub order_status_type: String,
    pub currency_pair: String,
    #[serde(default)] pub order_side: String,
    #[serde(default)] pub executed_price: String,
    #[serde(default)] pub executed_quantity: String,
    #[serde(default)] pub executed_fee: String,
    #[serde(default)] pub original_price: String,
    #[serde(default)] pub original_quantity: String,
    #[serde(default)] pub remaining_quantity: String,
    #[serde(default)] pub order_type: String,
    #[serde(default)] pub failed_reason: String,
    #[serde(default)] pub time_in_force: String,
    #[serde(default)] pub order_created_at: String,
    #[serde(default)] pub order_updated_at: String,
}

impl OrderStatusUpdate {
    pub fn is_filled(&self) -> bool { self.order_status_type == ORDER_STATUS_FILLED }
}

/// Body POST /v1/orders/limit. Dibangun sekali per fill, tidak dimutasi.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterOrderRequest {
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub pair: String,
    pub post_only: bool,
    pub time_in_force: &'static str,
    pub allow_margin: bool,
    pub customer_order_id: String,
}

impl CounterOrderRequest {
    pub fn notional(&self) -> Decimal {
        self.quantity.checked_mul(self.price).unwrap_or_default().normalize()
    }
}

// ---- Stream envelope ----
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Semua jenis pesan account stream yang dikenal + `Unknown` untuk tipe baru.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Authenticated,
    Pong,
    OrderProcessed,
    AccountTrade,
    AccountHistory,
    OpenOrdersUpdate(Vec<OpenOrder>),
    BalanceUpdate(BalanceUpdate),
    OrderStatusUpdate(OrderStatusUpdate),
    Unknown(String),
}

impl StreamMessage {
    /// Decode satu text frame `{type, data}` menjadi varian tertutup.
    pub fn decode(text: &str) -> Result<StreamMessage, serde_json::Error> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let msg = match raw.kind.as_str() {
            "AUTHENTICATED" => StreamMessage::Authenticated,
            "PONG" => StreamMessage::Pong,
            "ORDER_PROCESSED" => StreamMessage::OrderProcessed,
            "NEW_ACCOUNT_TRADE" => StreamMessage::AccountTrade,
            "NEW_ACCOUNT_HISTORY_RECORD" => StreamMessage::AccountHistory,
            "OPEN_ORDERS_UPDATE" => StreamMessage::OpenOrdersUpdate(serde_json::from_value(raw.data)?),
            "BALANCE_UPDATE" => StreamMessage::BalanceUpdate(serde_json::from_value(raw.data)?),
            "ORDER_STATUS_UPDATE" => StreamMessage::OrderStatusUpdate(serde_json::from_value(raw.data)?),
            _ => StreamMessage::Unknown(raw.kind),
        };
        Ok(msg)
    }

    /// Label untuk metrics / log.
    pub fn kind(&self) -> &str {
        match self {
            StreamMessage::Authenticated => "AUTHENTICATED",
            StreamMessage::Pong => "PONG",
            StreamMessage::OrderProcessed => "ORDER_PROCESSED",
            StreamMessage::AccountTrade => "NEW_ACCOUNT_TRADE",
            StreamMessage::AccountHistory => "NEW_ACCOUNT_HISTORY_RECORD",
            StreamMessage::OpenOrdersUpdate(_) => "OPEN_ORDERS_UPDATE",
            StreamMessage::BalanceUpdate(_) => "BALANCE_UPDATE",
            StreamMessage::OrderStatusUpdate(_) => "ORDER_STATUS_UPDATE",
            StreamMessage::Unknown(_) => "UNKNOWN",
        }
    }
}
