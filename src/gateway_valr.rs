// ===============================
// src/gateway_valr.rs
// ===============================
//
// VALR REST: kirim LIMIT order (POST /v1/orders/limit) yang sudah ditandatangani.
// Satu percobaan saja: tidak ada retry. Timeout eksplisit = kegagalan submit.
//
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;

use crate::domain::CounterOrderRequest;
use crate::valr::{AuthHeaders, LIMIT_ORDER_PATH};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http client build failed: {0}")]
    Client(reqwest::Error),
    #[error("order request timed out after {0:?}")]
    Timeout(Duration),
    #[error("http transport error: {0}")]
    Transport(reqwest::Error),
    #[error("exchange rejected order ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Body JSON + header auth yang menandatangani body persis itu.
#[derive(Debug, Clone)]
pub struct SignedOrder {
    pub request: CounterOrderRequest,
    pub body: String,
    pub headers: AuthHeaders,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub status: u16,
    pub order_id: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ValrRest {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ValrRest {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(GatewayError::Client)?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), timeout })
    }

    pub async fn place_limit_order(&self, order: &SignedOrder) -> Result<OrderAck, GatewayError> {
        let url = format!("{}{}", self.base_url, LIMIT_ORDER_PATH);
        let mut req = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(order.body.clone());
        for (name, value) in order.headers.pairs() {
            req = req.header(name, value);
        }

        let rsp = req.send().await.map_err(|e| self.classify(e))?;
        let status = rsp.status();
        let text = rsp.text().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            return Err(GatewayError::Rejected { status: status.as_u16(), body: text });
        }

        // Contoh respon: {"id":"558f5e0a-ffd1-46dd-8fae-763d93fa2f25"}
        let raw: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        let order_id = raw.get("id").and_then(|v| v.as_str()).map(str::to_string);
        Ok(OrderAck { status: status.as_u16(), order_id, raw })
    }

    fn classify(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Transport(e)
        }
    }
}
