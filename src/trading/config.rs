//! Strategy configuration.

use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Parameters of the dip-buying strategy. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct StrategyConfig {
    /// Watch-list of base asset symbols, in priority order for tie-breaks
    pub coins: Vec<String>,

    /// Currency every pair is quoted in
    pub quote_currency: String,

    /// 24h drop (percent, positive) that qualifies a symbol for an initial buy
    pub purchase_drop_percent: Decimal,

    /// Drops below cost basis (percent) that trigger each average-down; entry 0 is the initial buy
    pub average_down_steps: Vec<Decimal>,

    /// Gain (percent) above which the trailing stop is armed
    pub minimum_profit_percentage: Decimal,

    /// Retreat from the highest price (percent) that triggers a profit sale
    pub stop_loss_sale_percentage: Decimal,

    /// Tolerated loss (percent) per week held, used once a position is old enough
    pub negative_profit_levels: Vec<Decimal>,

    /// Weeks a position must be held before a loss sale is considered
    pub minimum_weeks_for_loss_sale: u32,

    /// Maximum number of concurrently held assets
    pub max_held_coins: usize,

    /// Fraction of total funds (cash + holdings at cost) to commit per buy
    pub use_funds_portion_per_trade: Decimal,

    /// Exchange taker fee in percent
    pub taker_fee_percentage: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            coins: vec!["BTC".to_string(), "ETH".to_string()],
            quote_currency: "USDC".to_string(),
            purchase_drop_percent: dec!(5),
            average_down_steps: vec![dec!(0), dec!(2), dec!(4), dec!(6)],
            minimum_profit_percentage: dec!(2),
            stop_loss_sale_percentage: dec!(1),
            negative_profit_levels: vec![dec!(1), dec!(2), dec!(3), dec!(4), dec!(5)],
            minimum_weeks_for_loss_sale: 3,
            max_held_coins: 5,
            use_funds_portion_per_trade: dec!(0.2),
            taker_fee_percentage: dec!(0.6),
        }
    }
}

impl StrategyConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coins.is_empty() {
            return Err(invalid("strategy.coins must not be empty"));
        }
        let mut seen = HashSet::new();
        for coin in &self.coins {
            if coin.trim().is_empty() {
                return Err(invalid("strategy.coins contains an empty symbol"));
            }
            if !seen.insert(coin.as_str()) {
                return Err(invalid(format!("strategy.coins lists {} twice", coin)));
            }
        }
        if self.quote_currency.trim().is_empty() {
            return Err(invalid("strategy.quoteCurrency must not be empty"));
        }

        match self.average_down_steps.first() {
            None => return Err(invalid("strategy.averageDownSteps must not be empty")),
            Some(first) if !first.is_zero() => {
                return Err(invalid("strategy.averageDownSteps must start with 0"))
            }
            Some(_) => {}
        }
        if self.average_down_steps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(invalid("strategy.averageDownSteps must be strictly increasing"));
        }
        if self.average_down_steps.iter().any(|s| *s >= Decimal::ONE_HUNDRED) {
            return Err(invalid("strategy.averageDownSteps entries must be below 100"));
        }

        if self.negative_profit_levels.is_empty() {
            return Err(invalid("strategy.negativeProfitLevels must not be empty"));
        }
        if self.negative_profit_levels.iter().any(|l| l.is_sign_negative()) {
            return Err(invalid("strategy.negativeProfitLevels must be non-negative"));
        }
        if self.minimum_weeks_for_loss_sale == 0 {
            return Err(invalid("strategy.minimumWeeksForLossSale must be at least 1"));
        }

        for (name, value) in [
            ("purchaseDropPercent", self.purchase_drop_percent),
            ("minimumProfitPercentage", self.minimum_profit_percentage),
            ("stopLossSalePercentage", self.stop_loss_sale_percentage),
            ("takerFeePercentage", self.taker_fee_percentage),
        ] {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(invalid(format!("strategy.{} must be non-negative", name)));
            }
        }
        if self.stop_loss_sale_percentage >= Decimal::ONE_HUNDRED {
            return Err(invalid("strategy.stopLossSalePercentage must be below 100"));
        }

        if self.max_held_coins == 0 {
            return Err(invalid("strategy.maxHeldCoins must be at least 1"));
        }
        if self.use_funds_portion_per_trade <= Decimal::ZERO
            || self.use_funds_portion_per_trade > Decimal::ONE
        {
            return Err(invalid(
                "strategy.useFundsPortionPerTrade must be in (0, 1]",
            ));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
