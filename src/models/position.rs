//! Position model representing one held asset and its lifecycle metadata.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A held quantity of one asset with its cost basis.
///
/// The symbol is the key in [`super::Portfolio`] and is not repeated inside the
/// persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Cost basis per unit, size-weighted over every buy
    pub average_purchase_price: Decimal,

    /// Total units held
    pub held_amount: Decimal,

    /// Time of the first purchase
    pub opened_at: DateTime<Utc>,

    /// Highest price observed since opening or the last average-down
    pub highest_price_seen: Decimal,

    /// Quote-currency fees paid on all buys
    #[serde(default)]
    pub accumulated_fees: Decimal,

    /// Index into the average-down ladder (0 = initial buy only)
    #[serde(default)]
    pub average_down_step: usize,

    /// Decimal places the exchange accepts for this asset's order size
    pub lot_precision: u32,
}

impl Position {
    /// Create a position from an initial buy.
    pub fn open(
        price: Decimal,
        amount: Decimal,
        fee: Decimal,
        lot_precision: u32,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            average_purchase_price: price,
            held_amount: amount,
            opened_at,
            highest_price_seen: price,
            accumulated_fees: fee,
            average_down_step: 0,
            lot_precision,
        }
    }

    /// Quote currency invested at cost basis.
    pub fn invested(&self) -> Decimal {
        self.average_purchase_price * self.held_amount
    }

    /// Unrealized performance at `price`, in percent of cost basis.
    pub fn performance_pct(&self, price: Decimal) -> Decimal {
        if self.average_purchase_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.average_purchase_price) / self.average_purchase_price * Decimal::ONE_HUNDRED
    }

    /// Performance of the best price seen so far, in percent.
    pub fn highest_performance_pct(&self) -> Decimal {
        self.performance_pct(self.highest_price_seen)
    }

    /// Raise the high-water mark. Returns true if it moved.
    pub fn observe_price(&mut self, price: Decimal) -> bool {
        if price > self.highest_price_seen {
            self.highest_price_seen = price;
            true
        } else {
            false
        }
    }

    /// Add an incremental buy (average-down).
    ///
    /// The new cost basis is the value-weighted average of the old and new lots and the
    /// high-water mark restarts from the buy price.
    pub fn average_down(&mut self, price: Decimal, amount: Decimal, fee: Decimal) {
        let total_cost = self.invested() + price * amount;
        let total_amount = self.held_amount + amount;

        if !total_amount.is_zero() {
            self.average_purchase_price = total_cost / total_amount;
        }

        self.held_amount = total_amount;
        self.accumulated_fees += fee;
        self.highest_price_seen = price;
        self.average_down_step += 1;
    }

    /// Gross market value at `price`.
    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.held_amount * price
    }

    /// Net result of selling everything at `price`, after the taker fee on the sale
    /// and all fees paid on the buys.
    pub fn net_win_loss(&self, price: Decimal, taker_fee_pct: Decimal) -> Decimal {
        let proceeds = self.value_at(price) * (Decimal::ONE - taker_fee_pct / Decimal::ONE_HUNDRED);
        proceeds - self.invested() - self.accumulated_fees
    }

    /// Whole days elapsed since the first purchase.
    pub fn days_held(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_days().max(0)
    }

    /// Whole weeks elapsed since the first purchase.
    pub fn weeks_held(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_weeks().max(0)
    }
}
