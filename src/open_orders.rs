// ===============================
// src/open_orders.rs
// ===============================
use std::collections::BTreeMap;

use crate::domain::OpenOrder;
use crate::metrics::OPEN_ORDERS_TRACKED;

/// Snapshot open order terakhir dari exchange. Setiap update = ganti total.
#[derive(Debug, Default)]
pub struct OpenOrderBook {
    orders: Vec<OpenOrder>,
}

impl OpenOrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_open_orders(&mut self, snapshot: Vec<OpenOrder>) {
        self.orders = snapshot;
        OPEN_ORDERS_TRACKED.set(self.orders.len() as i64);
    }

    pub fn list(&self) -> &[OpenOrder] {
        &self.orders
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Proyeksi baca saja: per pair, harga naik.
    pub fn grouped_by_pair(&self) -> BTreeMap<&str, Vec<&OpenOrder>> {
        let mut groups: BTreeMap<&str, Vec<&OpenOrder>> = BTreeMap::new();
        for o in &self.orders {
            groups.entry(o.currency_pair.as_str()).or_default().push(o);
        }
        for list in groups.values_mut() {
            list.sort_by(|a, b| a.price.cmp(&b.price));
        }
        groups
    }
}
