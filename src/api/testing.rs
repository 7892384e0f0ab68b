//! In-memory exchange double for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::exchange::{ExchangeError, MarketData, OrderExecution, OrderOutcome, OrderSide};

/// An order as received by [`ScriptedExchange`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub pair: String,
    pub side: OrderSide,
    pub size: Decimal,
}

#[derive(Debug, Default)]
struct Script {
    prices: HashMap<String, Decimal>,
    changes: HashMap<String, Decimal>,
    precisions: HashMap<String, u32>,
    balances: HashMap<String, Decimal>,
    failing_pairs: HashSet<String>,
    reject_reason: Option<String>,
    fail_orders: bool,
    orders: Vec<RecordedOrder>,
    precision_lookups: usize,
    latency: Duration,
}

/// Exchange whose answers are set by the test. Unknown pairs fail.
#[derive(Debug, Default)]
pub struct ScriptedExchange {
    script: Mutex<Script>,
}

impl ScriptedExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap();
        f(&mut script)
    }

    pub fn set_price(&self, pair: &str, price: Decimal) {
        self.with(|s| s.prices.insert(pair.to_string(), price));
    }

    pub fn set_change(&self, pair: &str, change: Decimal) {
        self.with(|s| s.changes.insert(pair.to_string(), change));
    }

    pub fn set_precision(&self, pair: &str, precision: u32) {
        self.with(|s| s.precisions.insert(pair.to_string(), precision));
    }

    pub fn set_balance(&self, currency: &str, balance: Decimal) {
        self.with(|s| s.balances.insert(currency.to_string(), balance));
    }

    /// Delay every call by `latency`, to keep a job tick in flight.
    pub fn set_latency(&self, latency: Duration) {
        self.with(|s| s.latency = latency);
    }

    async fn respond(&self) {
        let latency = self.with(|s| s.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Make every market-data call for `pair` fail until [`Self::recover_pair`].
    pub fn fail_pair(&self, pair: &str) {
        self.with(|s| s.failing_pairs.insert(pair.to_string()));
    }

    pub fn recover_pair(&self, pair: &str) {
        self.with(|s| s.failing_pairs.remove(pair));
    }

    /// Reject every order with `reason`, or accept again with `None`.
    pub fn reject_orders(&self, reason: Option<&str>) {
        self.with(|s| s.reject_reason = reason.map(str::to_string));
    }

    /// Make order placement fail with a server error.
    pub fn fail_orders(&self, fail: bool) {
        self.with(|s| s.fail_orders = fail);
    }

    pub fn orders(&self) -> Vec<RecordedOrder> {
        self.with(|s| s.orders.clone())
    }

    pub fn precision_lookups(&self) -> usize {
        self.with(|s| s.precision_lookups)
    }

    fn lookup<T: Copy>(
        &self,
        pair: &str,
        table: impl FnOnce(&Script) -> Option<T>,
    ) -> Result<T, ExchangeError> {
        self.with(|s| {
            if s.failing_pairs.contains(pair) {
                return Err(unavailable(pair));
            }
            table(&*s).ok_or_else(|| ExchangeError::decode(pair, "unknown product"))
        })
    }
}

fn unavailable(endpoint: &str) -> ExchangeError {
    ExchangeError::Status {
        endpoint: endpoint.to_string(),
        status: 503,
        body: "scripted failure".to_string(),
    }
}

#[async_trait]
impl MarketData for ScriptedExchange {
    async fn current_price(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        self.respond().await;
        self.lookup(pair, |s| s.prices.get(pair).copied())
    }

    async fn percent_change_24h(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        self.respond().await;
        self.lookup(pair, |s| s.changes.get(pair).copied())
    }

    async fn lot_precision(&self, pair: &str) -> Result<u32, ExchangeError> {
        self.respond().await;
        self.with(|s| s.precision_lookups += 1);
        self.lookup(pair, |s| Some(s.precisions.get(pair).copied().unwrap_or(8)))
    }

    async fn quote_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        self.respond().await;
        Ok(self.with(|s| s.balances.get(currency).copied().unwrap_or(Decimal::ZERO)))
    }
}

#[async_trait]
impl OrderExecution for ScriptedExchange {
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<OrderOutcome, ExchangeError> {
        self.respond().await;
        self.with(|s| {
            if s.fail_orders {
                return Err(unavailable(pair));
            }
            if let Some(reason) = &s.reject_reason {
                return Ok(OrderOutcome::Rejected {
                    reason: reason.clone(),
                });
            }
            s.orders.push(RecordedOrder {
                pair: pair.to_string(),
                side,
                size,
            });
            Ok(OrderOutcome::Filled {
                order_id: format!("order-{}", s.orders.len()),
            })
        })
    }
}
