//! Dry-run exchange: real market data, simulated fills.
//!
//! Orders fill immediately at the current price reported by the wrapped market data
//! source, minus the taker fee. Cash and holdings live in memory only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

use super::exchange::{ExchangeError, MarketData, OrderExecution, OrderOutcome, OrderSide};
use crate::models::Portfolio;

#[derive(Debug, Default)]
struct PaperBook {
    cash: Decimal,
    holdings: HashMap<String, Decimal>,
    next_order: u64,
}

/// Simulated account that trades against live prices.
pub struct PaperExchange {
    market: Arc<dyn MarketData>,
    quote_currency: String,
    taker_fee_pct: Decimal,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(
        market: Arc<dyn MarketData>,
        quote_currency: &str,
        starting_cash: Decimal,
        taker_fee_pct: Decimal,
    ) -> Self {
        Self {
            market,
            quote_currency: quote_currency.to_string(),
            taker_fee_pct,
            book: Mutex::new(PaperBook {
                cash: starting_cash,
                ..Default::default()
            }),
        }
    }

    /// Seed holdings from already-persisted positions so they can be sold.
    pub fn with_holdings(mut self, portfolio: &Portfolio) -> Self {
        self.book.get_mut().holdings = portfolio
            .positions
            .iter()
            .map(|(symbol, position)| (symbol.clone(), position.held_amount))
            .collect();
        self
    }

    pub async fn cash(&self) -> Decimal {
        self.book.lock().await.cash
    }

    pub async fn holding(&self, symbol: &str) -> Decimal {
        self.book
            .lock()
            .await
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn fee_on(&self, notional: Decimal) -> Decimal {
        notional * self.taker_fee_pct / Decimal::ONE_HUNDRED
    }
}

#[async_trait]
impl MarketData for PaperExchange {
    async fn current_price(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        self.market.current_price(pair).await
    }

    async fn percent_change_24h(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        self.market.percent_change_24h(pair).await
    }

    async fn lot_precision(&self, pair: &str) -> Result<u32, ExchangeError> {
        self.market.lot_precision(pair).await
    }

    async fn quote_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        if currency == self.quote_currency {
            Ok(self.cash().await)
        } else {
            Ok(self.holding(currency).await)
        }
    }
}

#[async_trait]
impl OrderExecution for PaperExchange {
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<OrderOutcome, ExchangeError> {
        let base = pair
            .split_once('-')
            .map(|(base, _)| base)
            .ok_or_else(|| ExchangeError::decode(pair, "not a BASE-QUOTE pair"))?;
        let price = self.market.current_price(pair).await?;
        let notional = size * price;
        let fee = self.fee_on(notional);

        let mut book = self.book.lock().await;
        match side {
            OrderSide::Buy => {
                if notional + fee > book.cash {
                    return Ok(OrderOutcome::Rejected {
                        reason: format!(
                            "insufficient {}: need {}, have {}",
                            self.quote_currency,
                            (notional + fee).round_dp(8),
                            book.cash
                        ),
                    });
                }
                book.cash -= notional + fee;
                *book.holdings.entry(base.to_string()).or_insert(Decimal::ZERO) += size;
            }
            OrderSide::Sell => {
                let held = book.holdings.get(base).copied().unwrap_or(Decimal::ZERO);
                if size > held {
                    return Ok(OrderOutcome::Rejected {
                        reason: format!("insufficient {}: need {}, have {}", base, size, held),
                    });
                }
                let remaining = held - size;
                if remaining.is_zero() {
                    book.holdings.remove(base);
                } else {
                    book.holdings.insert(base.to_string(), remaining);
                }
                book.cash += notional - fee;
            }
        }

        book.next_order += 1;
        let order_id = format!("paper-{}", book.next_order);
        info!(
            order_id = %order_id,
            pair = %pair,
            side = side.as_str(),
            size = %size,
            price = %price,
            fee = %fee.round_dp(8),
            cash = %book.cash.round_dp(8),
            "[DRY RUN] Simulated fill"
        );

        Ok(OrderOutcome::Filled { order_id })
    }
}
