//! Portfolio model: the table of held positions plus last-known cash.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Position;

/// All held positions keyed by asset symbol.
///
/// A `BTreeMap` keeps the serialized form in a stable key order, so saving the same
/// state twice produces identical files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    #[serde(default)]
    pub positions: BTreeMap<String, Position>,

    /// Last quote-currency balance reported by the exchange (not persisted)
    #[serde(skip)]
    pub cash: Decimal,

    /// Simulated account balance. Only dry-run state files carry it.
    #[serde(default, rename = "paperCash", skip_serializing_if = "Option::is_none")]
    pub paper_cash: Option<Decimal>,
}

impl Portfolio {
    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn is_held(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn insert(&mut self, symbol: String, position: Position) {
        self.positions.insert(symbol, position);
    }

    pub fn remove(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    /// Number of held positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Held symbols in key order.
    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    /// Sum of all positions valued at cost basis.
    pub fn holdings_at_cost(&self) -> Decimal {
        self.positions.values().map(Position::invested).sum()
    }
}
