// ===============================
// src/balances.rs (Balance ledger & valuasi reference currency)
// ===============================

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::{Balance, BalanceUpdate};
use crate::metrics::{BALANCES_TRACKED, PORTFOLIO_AVAILABLE, PORTFOLIO_TOTAL};

/// `total_in_reference × (available / total)`, 0 jika total <= 0.
pub fn available_in_reference(total_in_reference: Decimal, available: Decimal, total: Decimal) -> Decimal {
    if total <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    available
        .checked_div(total)
        .and_then(|ratio| total_in_reference.checked_mul(ratio))
        .unwrap_or(Decimal::ZERO)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRow {
    pub symbol: String,
    pub available: Decimal,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSummary {
    pub reference_currency: String,
    pub total: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
    pub rows: Vec<BalanceRow>, // desc by value
}

pub struct BalanceLedger {
    reference_currency: String,
    balances: HashMap<String, Balance>,
    last_update: Option<DateTime<Utc>>,
}

impl BalanceLedger {
    pub fn new(reference_currency: impl Into<String>) -> Self {
        Self {
            reference_currency: reference_currency.into(),
            balances: HashMap::new(),
            last_update: None,
        }
    }

    /// Ganti entry untuk simbol ini secara utuh (tanpa merge field).
    pub fn update_balance(&mut self, ev: BalanceUpdate) -> &Balance {
        let symbol = ev.currency.symbol.clone();
        let balance = Balance {
            symbol: symbol.clone(),
            available: ev.available,
            reserved: ev.reserved,
            total: ev.total,
            updated_at: ev.updated_at,
            available_in_reference: available_in_reference(ev.total_in_reference, ev.available, ev.total),
            total_in_reference: ev.total_in_reference,
            reference_currency: ev.reference_currency,
            currency: ev.currency,
        };
        self.last_update = Some(Utc::now());
        self.balances.insert(symbol.clone(), balance);

        // metrics
        BALANCES_TRACKED.set(self.balances.len() as i64);
        PORTFOLIO_TOTAL.set(self.total_value().to_f64().unwrap_or(0.0));
        PORTFOLIO_AVAILABLE.set(self.available_value().to_f64().unwrap_or(0.0));

        &self.balances[&symbol]
    }

    pub fn get(&self, symbol: &str) -> Option<&Balance> {
        self.balances.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn reference_currency(&self) -> &str {
        &self.reference_currency
    }

    pub fn non_zero(&self) -> Vec<&Balance> {
        self.balances.values().filter(|b| b.available > Decimal::ZERO).collect()
    }

    fn sum_in_reference(&self, pick: impl Fn(&Balance) -> Decimal) -> Decimal {
        self.balances
            .values()
            .filter(|b| b.reference_currency == self.reference_currency)
            .fold(Decimal::ZERO, |acc, b| acc.checked_add(pick(b)).unwrap_or(acc))
    }

    pub fn total_value(&self) -> Decimal {
        self.sum_in_reference(|b| b.total_in_reference)
    }

    pub fn available_value(&self) -> Decimal {
        self.sum_in_reference(|b| b.available_in_reference)
    }

    pub fn summary(&self) -> PortfolioSummary {
        let total = self.total_value();
        let available = self.available_value();
        let mut rows: Vec<BalanceRow> = self
            .non_zero()
            .into_iter()
            .filter(|b| b.available_in_reference > Decimal::ZERO)
            .map(|b| BalanceRow {
                symbol: b.symbol.clone(),
                available: b.available,
                value: b.available_in_reference,
            })
            .collect();
        rows.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.symbol.cmp(&b.symbol)));
        PortfolioSummary {
            reference_currency: self.reference_currency.clone(),
            total,
            available,
            reserved: total - available,
            rows,
        }
    }
}
