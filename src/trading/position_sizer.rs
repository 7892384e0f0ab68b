//! Budget allocation and order-size rounding.

use rust_decimal::{Decimal, RoundingStrategy};

use super::StrategyConfig;
use crate::models::Portfolio;

/// Calculator for how much quote currency a buy may commit and how large the order is.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    funds_portion: Decimal,
    taker_fee_pct: Decimal,
}

impl PositionSizer {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            funds_portion: config.use_funds_portion_per_trade,
            taker_fee_pct: config.taker_fee_percentage,
        }
    }

    /// Quote currency available for the next buy.
    ///
    /// The portion applies to total funds, with holdings valued at cost basis rather
    /// than the live price, and is capped by the cash actually on hand.
    pub fn budget(&self, cash: Decimal, portfolio: &Portfolio) -> Decimal {
        let cash = cash.max(Decimal::ZERO);
        let total = cash + portfolio.holdings_at_cost();
        cash.min(total * self.funds_portion)
    }

    /// Base-asset size for spending at most `budget` at `price`, taker fee included.
    ///
    /// The size is rounded half-down to the lot. If rounding lands above the budget the
    /// size drops by one lot, so `size × price + fee ≤ budget` always holds.
    pub fn buy_size(&self, budget: Decimal, price: Decimal, lot_precision: u32) -> Decimal {
        if price <= Decimal::ZERO || budget <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let spendable = budget / (Decimal::ONE + self.taker_fee_pct / Decimal::ONE_HUNDRED);
        let mut amount = (spendable / price)
            .round_dp_with_strategy(lot_precision, RoundingStrategy::MidpointTowardZero);

        let lot = Decimal::new(1, lot_precision.min(28));
        while amount > Decimal::ZERO && self.cost(amount, price) > budget {
            amount -= lot;
        }
        amount.max(Decimal::ZERO)
    }

    /// Quote currency a buy of `amount` at `price` takes from the account, fee included.
    pub fn cost(&self, amount: Decimal, price: Decimal) -> Decimal {
        amount * price + self.fee(amount, price)
    }

    /// Sell size for a held amount, rounded toward zero so it never exceeds the holding.
    pub fn sell_size(&self, held: Decimal, lot_precision: u32) -> Decimal {
        held.round_dp_with_strategy(lot_precision, RoundingStrategy::ToZero)
    }

    /// Taker fee in quote currency for trading `amount` at `price`.
    pub fn fee(&self, amount: Decimal, price: Decimal) -> Decimal {
        amount * price * self.taker_fee_pct / Decimal::ONE_HUNDRED
    }
}
