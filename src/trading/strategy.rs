//! Dip-buying strategy rules.
//!
//! This module decides, without touching the exchange:
//! - Which watch-list symbol (if any) to open a position in
//! - Whether a held position should average down, be sold, or be held
//!
//! Rules for a held position are checked in a fixed priority order and the first
//! match wins: average-down, time-decay loss cut, profit protection, hold.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::StrategyConfig;
use crate::models::{Portfolio, Position};

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Held long enough that a small loss is accepted
    TimeDecay,
    /// Price retreated from its high after the minimum profit was reached
    ProfitProtection,
    /// Operator requested the sale
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::TimeDecay => "time decay",
            ExitReason::ProfitProtection => "profit protection",
            ExitReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Outcome of evaluating one held position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Buy more at the current price; `trigger_price` is the ladder rung that was hit
    AverageDown { trigger_price: Decimal },
    Sell(ExitReason),
    Hold,
}

/// A watch-list symbol that dropped enough to buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub symbol: String,
    pub change_24h: Decimal,
}

/// Strategy rules bound to one configuration.
#[derive(Debug, Clone)]
pub struct Strategy {
    config: StrategyConfig,
}

impl Strategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Decide what to do with `position` at `price`.
    ///
    /// The caller must already have raised the high-water mark with
    /// [`Position::observe_price`], so `highest_price_seen >= price` holds here.
    pub fn evaluate(&self, position: &Position, price: Decimal, now: DateTime<Utc>) -> Decision {
        if let Some(trigger_price) = self.next_average_down_price(position) {
            if price <= trigger_price {
                debug!(
                    price = %price,
                    trigger = %trigger_price,
                    step = position.average_down_step,
                    "Average-down triggered"
                );
                return Decision::AverageDown { trigger_price };
            }
        }

        let performance = position.performance_pct(price);

        if performance < Decimal::ZERO {
            let weeks = position.weeks_held(now);
            if let Some(tolerance) = self.loss_tolerance(weeks) {
                if performance >= -tolerance {
                    debug!(
                        performance = %performance.round_dp(2),
                        weeks,
                        tolerance = %tolerance,
                        "Loss within time-decay tolerance"
                    );
                    return Decision::Sell(ExitReason::TimeDecay);
                }
            }
        }

        if price > position.average_purchase_price
            && performance >= self.config.minimum_profit_percentage
        {
            let stop_price = self.profit_stop_price(position);
            if price <= stop_price {
                debug!(
                    price = %price,
                    highest = %position.highest_price_seen,
                    stop = %stop_price,
                    "Profit protection triggered"
                );
                return Decision::Sell(ExitReason::ProfitProtection);
            }
        }

        Decision::Hold
    }

    /// Price at which the next average-down fires, or `None` at the end of the ladder.
    pub fn next_average_down_price(&self, position: &Position) -> Option<Decimal> {
        let next = self.config.average_down_steps.get(position.average_down_step + 1)?;
        Some(position.average_purchase_price * (Decimal::ONE - next / Decimal::ONE_HUNDRED))
    }

    /// Loss (percent, positive) accepted after `weeks` held, or `None` if too early.
    pub fn loss_tolerance(&self, weeks: i64) -> Option<Decimal> {
        let levels = &self.config.negative_profit_levels;
        if weeks < i64::from(self.config.minimum_weeks_for_loss_sale) || levels.is_empty() {
            return None;
        }
        let idx = (weeks as usize).min(levels.len()) - 1;
        levels.get(idx).copied()
    }

    /// Trailing stop below the highest price seen.
    pub fn profit_stop_price(&self, position: &Position) -> Decimal {
        position.highest_price_seen
            * (Decimal::ONE - self.config.stop_loss_sale_percentage / Decimal::ONE_HUNDRED)
    }

    /// Whether the best price seen so far has gone far enough for the trailing stop
    /// to lock in at least the minimum profit.
    pub fn is_profit_armed(&self, position: &Position) -> bool {
        position.highest_performance_pct()
            > self.config.minimum_profit_percentage + self.config.stop_loss_sale_percentage
    }

    /// Whether another position may be opened.
    pub fn has_capacity(&self, portfolio: &Portfolio) -> bool {
        portfolio.len() < self.config.max_held_coins
    }

    /// Watch-list symbols that are not yet held, in watch-list order.
    pub fn unheld_symbols<'a>(&'a self, portfolio: &'a Portfolio) -> impl Iterator<Item = &'a str> {
        self.config
            .coins
            .iter()
            .map(String::as_str)
            .filter(move |symbol| !portfolio.is_held(symbol))
    }

    /// Pick the most negative qualifying 24h change. Ties keep the input order.
    pub fn select_candidate(&self, changes: &[(String, Decimal)]) -> Option<Candidate> {
        let threshold = -self.config.purchase_drop_percent;
        let mut best: Option<&(String, Decimal)> = None;

        for entry in changes {
            if entry.1 > threshold {
                continue;
            }
            match best {
                Some((_, best_change)) if entry.1 >= *best_change => {}
                _ => best = Some(entry),
            }
        }

        best.map(|(symbol, change)| Candidate {
            symbol: symbol.clone(),
            change_24h: *change,
        })
    }
}
