//! Strategy engine: applies the strategy rules against the exchange and owns the portfolio.
//!
//! Every operation here mutates the portfolio, so callers serialize access through a
//! single lock (see `bot::Bot`). A failure on one symbol never aborts the rest of a pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::{trading_pair, ExchangeError, MarketData, OrderExecution, OrderOutcome, OrderSide};
use crate::models::{Portfolio, Position};
use crate::store::PositionStore;

use super::{Decision, ExitReason, PositionSizer, Strategy, StrategyConfig};

/// Failure of a single trading operation.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("order for {symbol} rejected: {reason}")]
    Rejected { symbol: String, reason: String },

    #[error("{0} is not held")]
    NotHeld(String),

    #[error("order size for {symbol} rounds to zero")]
    ZeroSize { symbol: String },
}

/// What happened to one held position during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    Held,
    AveragedDown,
    Sold(ExitReason),
}

/// Counts from one held-position pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub evaluated: usize,
    pub averaged_down: usize,
    pub sold: usize,
    pub failed: usize,
}

/// Running totals since startup.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub initial_buys: u64,
    pub average_downs: u64,
    pub sells: u64,
    pub rejected_orders: u64,
    pub failed_evaluations: u64,
    pub realized_pnl: Decimal,
    pub last_candidate_run: Option<DateTime<Utc>>,
    pub last_held_run: Option<DateTime<Utc>>,
}

/// Owns the portfolio and executes strategy decisions.
pub struct StrategyEngine {
    strategy: Strategy,
    sizer: PositionSizer,
    market: Arc<dyn MarketData>,
    orders: Arc<dyn OrderExecution>,
    store: PositionStore,
    portfolio: Portfolio,
    lot_precisions: HashMap<String, u32>,
    last_prices: BTreeMap<String, Decimal>,
    stats: EngineStats,
}

impl StrategyEngine {
    pub fn new(
        config: StrategyConfig,
        market: Arc<dyn MarketData>,
        orders: Arc<dyn OrderExecution>,
        store: PositionStore,
        portfolio: Portfolio,
    ) -> Self {
        let sizer = PositionSizer::new(&config);
        Self {
            strategy: Strategy::new(config),
            sizer,
            market,
            orders,
            store,
            portfolio,
            lot_precisions: HashMap::new(),
            last_prices: BTreeMap::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Most recent price fetched for each held symbol.
    pub fn last_prices(&self) -> &BTreeMap<String, Decimal> {
        &self.last_prices
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    fn quote(&self) -> &str {
        &self.strategy.config().quote_currency
    }

    // ==================== Initial Purchase ====================

    /// Open at most one new position in the watch-list symbol that dropped the most.
    ///
    /// Returns the symbol bought, if any.
    pub async fn evaluate_initial_purchase(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, TradeError> {
        self.stats.last_candidate_run = Some(now);

        if !self.strategy.has_capacity(&self.portfolio) {
            debug!(
                held = self.portfolio.len(),
                max = self.strategy.config().max_held_coins,
                "Maximum held coins reached, skipping candidate scan"
            );
            return Ok(None);
        }

        let symbols: Vec<String> = self
            .strategy
            .unheld_symbols(&self.portfolio)
            .map(str::to_string)
            .collect();

        let mut changes = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let pair = trading_pair(&symbol, self.quote());
            match self.market.percent_change_24h(&pair).await {
                Ok(change) => {
                    debug!(symbol = %symbol, change = %change, "24h change");
                    changes.push((symbol, change));
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Could not fetch 24h change, skipping");
                }
            }
        }

        let Some(candidate) = self.strategy.select_candidate(&changes) else {
            debug!(scanned = changes.len(), "No symbol dropped enough to buy");
            return Ok(None);
        };

        info!(
            symbol = %candidate.symbol,
            change = %candidate.change_24h,
            "Buy candidate selected"
        );
        self.open_position(&candidate.symbol, now).await?;
        Ok(Some(candidate.symbol))
    }

    async fn open_position(&mut self, symbol: &str, now: DateTime<Utc>) -> Result<(), TradeError> {
        let pair = trading_pair(symbol, self.quote());
        let price = self.market.current_price(&pair).await?;
        let cash = self.refresh_cash().await?;
        let budget = self.sizer.budget(cash, &self.portfolio);
        let lot_precision = self.lot_precision(&pair).await?;

        let amount = self.sizer.buy_size(budget, price, lot_precision);
        if amount.is_zero() {
            info!(symbol = %symbol, budget = %budget, price = %price, "Buy size rounds to zero, holding");
            return Err(TradeError::ZeroSize {
                symbol: symbol.to_string(),
            });
        }

        let order_id = self.submit(symbol, &pair, OrderSide::Buy, amount).await?;
        let fee = self.sizer.fee(amount, price);

        self.portfolio.insert(
            symbol.to_string(),
            Position::open(price, amount, fee, lot_precision, now),
        );
        self.last_prices.insert(symbol.to_string(), price);
        self.stats.initial_buys += 1;

        info!(
            symbol = %symbol,
            side = "BUY",
            size = %amount,
            price = %price,
            cost = %(amount * price).round_dp(8),
            fee = %fee.round_dp(8),
            order_id = %order_id,
            "Opened position"
        );

        self.persist().await;
        Ok(())
    }

    // ==================== Held Positions ====================

    /// Evaluate every held position once.
    pub async fn evaluate_held_positions(&mut self, now: DateTime<Utc>) -> PassSummary {
        self.stats.last_held_run = Some(now);

        let mut summary = PassSummary::default();
        let mut dirty = false;

        for symbol in self.portfolio.symbols() {
            summary.evaluated += 1;
            match self.evaluate_position(&symbol, now, &mut dirty).await {
                Ok(PositionAction::Held) => {}
                Ok(PositionAction::AveragedDown) => summary.averaged_down += 1,
                Ok(PositionAction::Sold(_)) => summary.sold += 1,
                Err(e) => {
                    summary.failed += 1;
                    self.stats.failed_evaluations += 1;
                    warn!(symbol = %symbol, error = %e, "Position evaluation failed, retrying next cycle");
                }
            }
        }

        // Buys and sells persist on their own; this catches high-water moves on held positions.
        if dirty {
            self.persist().await;
        }

        debug!(
            evaluated = summary.evaluated,
            averaged_down = summary.averaged_down,
            sold = summary.sold,
            failed = summary.failed,
            "Held-position pass complete"
        );
        summary
    }

    async fn evaluate_position(
        &mut self,
        symbol: &str,
        now: DateTime<Utc>,
        dirty: &mut bool,
    ) -> Result<PositionAction, TradeError> {
        let pair = trading_pair(symbol, self.quote());
        let price = self.market.current_price(&pair).await?;
        self.last_prices.insert(symbol.to_string(), price);

        let position = self
            .portfolio
            .get_mut(symbol)
            .ok_or_else(|| TradeError::NotHeld(symbol.to_string()))?;
        if position.observe_price(price) {
            *dirty = true;
        }

        debug!(
            symbol = %symbol,
            price = %price,
            average = %position.average_purchase_price,
            highest = %position.highest_price_seen,
            performance = %position.performance_pct(price).round_dp(2),
            step = position.average_down_step,
            "Evaluating position"
        );

        match self.strategy.evaluate(position, price, now) {
            Decision::AverageDown { trigger_price } => {
                self.average_down(symbol, &pair, price, trigger_price).await?;
                Ok(PositionAction::AveragedDown)
            }
            Decision::Sell(reason) => {
                self.close_position(symbol, &pair, price, reason).await?;
                Ok(PositionAction::Sold(reason))
            }
            Decision::Hold => Ok(PositionAction::Held),
        }
    }

    async fn average_down(
        &mut self,
        symbol: &str,
        pair: &str,
        price: Decimal,
        trigger_price: Decimal,
    ) -> Result<(), TradeError> {
        let cash = self.refresh_cash().await?;
        let budget = self.sizer.budget(cash, &self.portfolio);

        let position = self
            .portfolio
            .get(symbol)
            .ok_or_else(|| TradeError::NotHeld(symbol.to_string()))?;
        let spend = budget.min(position.value_at(price));
        let amount = self.sizer.buy_size(spend, price, position.lot_precision);
        if amount.is_zero() {
            info!(symbol = %symbol, budget = %budget, "Average-down size rounds to zero, holding");
            return Err(TradeError::ZeroSize {
                symbol: symbol.to_string(),
            });
        }

        let order_id = self.submit(symbol, pair, OrderSide::Buy, amount).await?;
        let fee = self.sizer.fee(amount, price);

        let position = self
            .portfolio
            .get_mut(symbol)
            .ok_or_else(|| TradeError::NotHeld(symbol.to_string()))?;
        position.average_down(price, amount, fee);
        self.stats.average_downs += 1;

        info!(
            symbol = %symbol,
            side = "BUY",
            size = %amount,
            price = %price,
            trigger = %trigger_price,
            fee = %fee.round_dp(8),
            new_average = %position.average_purchase_price.round_dp(8),
            step = position.average_down_step,
            order_id = %order_id,
            "Averaged down"
        );

        self.persist().await;
        Ok(())
    }

    // ==================== Selling ====================

    /// Sell the whole position in `symbol` now, regardless of strategy state.
    pub async fn sell(&mut self, symbol: &str) -> Result<(), TradeError> {
        if !self.portfolio.is_held(symbol) {
            return Err(TradeError::NotHeld(symbol.to_string()));
        }
        let pair = trading_pair(symbol, self.quote());
        let price = self.market.current_price(&pair).await?;
        self.close_position(symbol, &pair, price, ExitReason::Manual).await
    }

    async fn close_position(
        &mut self,
        symbol: &str,
        pair: &str,
        price: Decimal,
        reason: ExitReason,
    ) -> Result<(), TradeError> {
        let position = self
            .portfolio
            .get(symbol)
            .ok_or_else(|| TradeError::NotHeld(symbol.to_string()))?;
        let size = self.sizer.sell_size(position.held_amount, position.lot_precision);
        if size.is_zero() {
            return Err(TradeError::ZeroSize {
                symbol: symbol.to_string(),
            });
        }

        let order_id = self.submit(symbol, pair, OrderSide::Sell, size).await?;

        let Some(position) = self.portfolio.remove(symbol) else {
            return Err(TradeError::NotHeld(symbol.to_string()));
        };
        self.last_prices.remove(symbol);
        let fee_pct = self.strategy.config().taker_fee_percentage;
        let net = position.net_win_loss(price, fee_pct);
        self.stats.sells += 1;
        self.stats.realized_pnl += net;

        info!(
            symbol = %symbol,
            side = "SELL",
            reason = %reason,
            size = %size,
            price = %price,
            average = %position.average_purchase_price.round_dp(8),
            fee = %self.sizer.fee(size, price).round_dp(8),
            net = %net.round_dp(2),
            performance = %position.performance_pct(price).round_dp(2),
            order_id = %order_id,
            "Closed position"
        );

        self.persist().await;
        Ok(())
    }

    // ==================== Helpers ====================

    async fn submit(
        &mut self,
        symbol: &str,
        pair: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<String, TradeError> {
        match self.orders.place_order(pair, side, size).await? {
            OrderOutcome::Filled { order_id } => {
                if self.portfolio.paper_cash.is_some() {
                    self.sync_paper_cash().await;
                }
                Ok(order_id)
            }
            OrderOutcome::Rejected { reason } => {
                self.stats.rejected_orders += 1;
                warn!(
                    symbol = %symbol,
                    side = side.as_str(),
                    size = %size,
                    reason = %reason,
                    "Order rejected"
                );
                Err(TradeError::Rejected {
                    symbol: symbol.to_string(),
                    reason,
                })
            }
        }
    }

    async fn refresh_cash(&mut self) -> Result<Decimal, ExchangeError> {
        let cash = self.market.quote_balance(self.quote()).await?;
        self.portfolio.cash = cash;
        Ok(cash)
    }

    /// Copy the simulated balance into the portfolio so it is saved with the positions.
    async fn sync_paper_cash(&mut self) {
        match self.market.quote_balance(self.quote()).await {
            Ok(cash) => {
                self.portfolio.cash = cash;
                self.portfolio.paper_cash = Some(cash);
            }
            Err(e) => warn!(error = %e, "Could not read simulated balance"),
        }
    }

    async fn lot_precision(&mut self, pair: &str) -> Result<u32, ExchangeError> {
        if let Some(precision) = self.lot_precisions.get(pair) {
            return Ok(*precision);
        }
        let precision = self.market.lot_precision(pair).await?;
        self.lot_precisions.insert(pair.to_string(), precision);
        Ok(precision)
    }

    /// Save the portfolio. A failed save is logged; the in-memory state stands and the
    /// next successful save reconciles the file.
    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.portfolio).await {
            error!(error = %e, path = %self.store.path().display(), "Failed to persist positions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedExchange;
    use crate::api::PaperExchange;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        _dir: TempDir,
        exchange: Arc<ScriptedExchange>,
        store: PositionStore,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = PositionStore::new(dir.path().join("currentAssets.json"));
            let exchange = Arc::new(ScriptedExchange::new());
            exchange.set_balance("USDC", dec!(1000));
            exchange.set_price("TEST-USDC", dec!(0.50));
            exchange.set_change("TEST-USDC", dec!(-6));
            exchange.set_precision("TEST-USDC", 3);
            Self {
                _dir: dir,
                exchange,
                store,
            }
        }

        fn engine(&self, coins: &[&str], portfolio: Portfolio) -> StrategyEngine {
            let config = StrategyConfig {
                coins: coins.iter().map(|c| c.to_string()).collect(),
                purchase_drop_percent: dec!(5),
                max_held_coins: 5,
                use_funds_portion_per_trade: dec!(0.2),
                average_down_steps: vec![dec!(0), dec!(2), dec!(4), dec!(6)],
                minimum_profit_percentage: dec!(2),
                stop_loss_sale_percentage: dec!(1),
                negative_profit_levels: vec![dec!(1), dec!(2), dec!(3), dec!(4), dec!(5)],
                taker_fee_percentage: Decimal::ZERO,
                ..Default::default()
            };
            StrategyEngine::new(
                config,
                self.exchange.clone(),
                self.exchange.clone(),
                self.store.clone(),
                portfolio,
            )
        }
    }

    fn held(avg: Decimal, highest: Decimal, step: usize, opened_at: DateTime<Utc>) -> Portfolio {
        let mut position = Position::open(avg, dec!(100), Decimal::ZERO, 3, opened_at);
        position.highest_price_seen = highest;
        position.average_down_step = step;
        let mut portfolio = Portfolio::default();
        portfolio.insert("TEST".to_string(), position);
        portfolio
    }

    #[tokio::test]
    async fn test_initial_buy() {
        let h = Harness::new();
        let mut engine = h.engine(&["TEST"], Portfolio::default());

        let bought = engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        assert_eq!(bought.as_deref(), Some("TEST"));
        let position = engine.portfolio().get("TEST").unwrap();
        assert_eq!(position.average_purchase_price, dec!(0.50));
        assert_eq!(position.highest_price_seen, dec!(0.50));
        assert_eq!(position.average_down_step, 0);
        // 20% of 1000 at 0.50
        assert_eq!(position.held_amount, dec!(400));
        assert_eq!(position.lot_precision, 3);

        let saved = h.store.load().await.unwrap();
        assert!(saved.is_held("TEST"));
    }

    #[tokio::test]
    async fn test_no_buy_without_enough_drop() {
        let h = Harness::new();
        h.exchange.set_change("TEST-USDC", dec!(-4));
        let mut engine = h.engine(&["TEST"], Portfolio::default());

        let bought = engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        assert_eq!(bought, None);
        assert!(engine.portfolio().is_empty());
        assert!(h.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_buys_each_coin_once() {
        let h = Harness::new();
        let mut engine = h.engine(&["TEST"], Portfolio::default());

        engine.evaluate_initial_purchase(Utc::now()).await.unwrap();
        let amount = engine.portfolio().get("TEST").unwrap().held_amount;
        let second = engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        assert_eq!(second, None);
        assert_eq!(engine.portfolio().get("TEST").unwrap().held_amount, amount);
        assert_eq!(h.exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_one_buy_per_tick_picks_largest_drop() {
        let h = Harness::new();
        for (pair, change) in [("AAA-USDC", dec!(-7)), ("BBB-USDC", dec!(-12)), ("CCC-USDC", dec!(-9))] {
            h.exchange.set_price(pair, dec!(2));
            h.exchange.set_change(pair, change);
        }
        let mut engine = h.engine(&["AAA", "BBB", "CCC"], Portfolio::default());

        let bought = engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        assert_eq!(bought.as_deref(), Some("BBB"));
        assert_eq!(engine.portfolio().len(), 1);
        assert_eq!(h.exchange.orders().len(), 1);
        assert_eq!(h.exchange.orders()[0].pair, "BBB-USDC");
    }

    #[tokio::test]
    async fn test_failed_change_fetch_skips_symbol() {
        let h = Harness::new();
        h.exchange.set_price("AAA-USDC", dec!(2));
        h.exchange.set_change("AAA-USDC", dec!(-20));
        h.exchange.fail_pair("AAA-USDC");
        let mut engine = h.engine(&["AAA", "TEST"], Portfolio::default());

        let bought = engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        assert_eq!(bought.as_deref(), Some("TEST"));
    }

    #[tokio::test]
    async fn test_max_held_coins_skips_scan() {
        let h = Harness::new();
        let mut engine = h.engine(&["TEST", "OTHER"], held(dec!(0.50), dec!(0.50), 0, Utc::now()));
        engine.strategy = Strategy::new(StrategyConfig {
            max_held_coins: 1,
            ..engine.strategy.config().clone()
        });

        assert_eq!(engine.evaluate_initial_purchase(Utc::now()).await.unwrap(), None);
        assert!(h.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_buy_leaves_portfolio_unchanged() {
        let h = Harness::new();
        h.exchange.reject_orders(Some("INSUFFICIENT_FUND"));
        let mut engine = h.engine(&["TEST"], Portfolio::default());

        let result = engine.evaluate_initial_purchase(Utc::now()).await;

        assert!(matches!(result, Err(TradeError::Rejected { .. })));
        assert!(engine.portfolio().is_empty());
        assert_eq!(engine.stats().rejected_orders, 1);
    }

    #[tokio::test]
    async fn test_cash_capped_buys_include_fee() {
        let h = Harness::new();
        let coins = ["AAA", "BBB", "CCC", "DDD"];
        for coin in coins {
            let pair = trading_pair(coin, "USDC");
            h.exchange.set_price(&pair, dec!(1));
            h.exchange.set_change(&pair, dec!(-10));
        }
        let paper = Arc::new(PaperExchange::new(
            h.exchange.clone(),
            "USDC",
            dec!(1000),
            dec!(0.6),
        ));
        let config = StrategyConfig {
            coins: coins.iter().map(|c| c.to_string()).collect(),
            use_funds_portion_per_trade: dec!(0.3),
            ..Default::default()
        };
        let mut engine = StrategyEngine::new(
            config,
            paper.clone(),
            paper.clone(),
            h.store.clone(),
            Portfolio::default(),
        );

        for _ in 0..6 {
            engine.evaluate_initial_purchase(Utc::now()).await.unwrap();
        }

        // The fourth buy only has about 101 USDC left and spends all of it, fee included
        assert_eq!(engine.portfolio().len(), 4);
        assert_eq!(engine.stats().rejected_orders, 0);
        let cash = paper.cash().await;
        assert!(cash >= Decimal::ZERO);
        assert!(cash < dec!(0.01));
    }

    #[tokio::test]
    async fn test_paper_cash_saved_with_positions() {
        let h = Harness::new();
        let paper = Arc::new(PaperExchange::new(
            h.exchange.clone(),
            "USDC",
            dec!(1000),
            Decimal::ZERO,
        ));
        let portfolio = Portfolio {
            paper_cash: Some(dec!(1000)),
            ..Default::default()
        };
        let mut engine = StrategyEngine::new(
            StrategyConfig {
                coins: vec!["TEST".to_string()],
                taker_fee_percentage: Decimal::ZERO,
                ..Default::default()
            },
            paper.clone(),
            paper.clone(),
            h.store.clone(),
            portfolio,
        );

        engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        // 20% of 1000 spent at 0.50
        assert_eq!(paper.cash().await, dec!(800));
        assert_eq!(h.store.load().await.unwrap().paper_cash, Some(dec!(800)));

        engine.sell("TEST").await.unwrap();
        assert_eq!(h.store.load().await.unwrap().paper_cash, Some(dec!(1000)));
    }

    #[tokio::test]
    async fn test_lot_precision_cached() {
        let h = Harness::new();
        h.exchange.set_price("AAA-USDC", dec!(2));
        h.exchange.set_change("AAA-USDC", dec!(-8));
        let mut engine = h.engine(&["TEST", "AAA"], Portfolio::default());

        engine.evaluate_initial_purchase(Utc::now()).await.unwrap();
        engine.portfolio.remove("AAA");
        engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        assert_eq!(h.exchange.precision_lookups(), 1);
    }

    #[tokio::test]
    async fn test_average_down_first_time() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.489));
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.50), 0, Utc::now()));

        let summary = engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(summary.averaged_down, 1);
        let position = engine.portfolio().get("TEST").unwrap();
        assert_eq!(position.average_down_step, 1);
        assert_eq!(position.average_purchase_price, dec!(0.4945));
        assert_eq!(position.highest_price_seen, dec!(0.489));
    }

    #[tokio::test]
    async fn test_average_down_second_time() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.479));
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.50), 1, Utc::now()));

        engine.evaluate_held_positions(Utc::now()).await;

        let position = engine.portfolio().get("TEST").unwrap();
        assert_eq!(position.average_down_step, 2);
        assert_eq!(position.average_purchase_price, dec!(0.4895));
    }

    #[tokio::test]
    async fn test_time_decay_sale_removes_position() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.495));
        let opened = Utc::now() - Duration::weeks(3) - Duration::days(1);
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.50), 3, opened));

        let summary = engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(summary.sold, 1);
        assert!(!engine.portfolio().is_held("TEST"));
        assert_eq!(h.exchange.orders()[0].side, OrderSide::Sell);
        assert_eq!(h.exchange.orders()[0].size, dec!(100));
        assert!(h.store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profit_protection_sale() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.5434));
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.55), 3, Utc::now()));

        engine.evaluate_held_positions(Utc::now()).await;

        assert!(engine.portfolio().is_empty());
        assert_eq!(engine.stats().sells, 1);
        assert_eq!(engine.stats().realized_pnl, dec!(4.34));
    }

    #[tokio::test]
    async fn test_hold_below_purchase() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.499));
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.501), 0, Utc::now()));

        let summary = engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(summary, PassSummary { evaluated: 1, ..Default::default() });
        assert!(engine.portfolio().is_held("TEST"));
        assert!(h.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_prices_persist_once() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.505));
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.50), 0, Utc::now()));

        engine.evaluate_held_positions(Utc::now()).await;
        assert_eq!(engine.portfolio().get("TEST").unwrap().highest_price_seen, dec!(0.505));
        assert!(h.store.path().exists());

        std::fs::remove_file(h.store.path()).unwrap();
        let before = engine.portfolio().clone();
        engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(engine.portfolio(), &before);
        assert!(!h.store.path().exists());
        assert!(h.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_after_average_down_is_idle() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.489));
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.50), 0, Utc::now()));

        let first = engine.evaluate_held_positions(Utc::now()).await;
        assert_eq!(first.averaged_down, 1);
        let after_first = engine.portfolio().clone();
        let saved = std::fs::read(h.store.path()).unwrap();

        let second = engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(second, PassSummary { evaluated: 1, ..Default::default() });
        assert_eq!(engine.portfolio(), &after_first);
        assert_eq!(std::fs::read(h.store.path()).unwrap(), saved);
        assert_eq!(h.exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_after_sell_is_idle() {
        let h = Harness::new();
        h.exchange.set_price("TEST-USDC", dec!(0.5434));
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.55), 3, Utc::now()));

        assert_eq!(engine.evaluate_held_positions(Utc::now()).await.sold, 1);
        let second = engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(second, PassSummary::default());
        assert!(engine.portfolio().is_empty());
        assert_eq!(h.exchange.orders().len(), 1);
        assert_eq!(engine.stats().sells, 1);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_mutation() {
        let h = Harness::new();
        // A regular file where the state directory should be makes every write fail
        let blocker = h._dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let mut engine = h.engine(&["TEST"], Portfolio::default());
        engine.store = PositionStore::new(blocker.join("currentAssets.json"));

        let bought = engine.evaluate_initial_purchase(Utc::now()).await.unwrap();

        assert_eq!(bought.as_deref(), Some("TEST"));
        assert_eq!(engine.portfolio().get("TEST").unwrap().held_amount, dec!(400));
        assert_eq!(h.exchange.orders().len(), 1);
        assert!(!blocker.join("currentAssets.json").exists());

        // The next successful save reconciles the file
        engine.store = h.store.clone();
        engine.sell("TEST").await.unwrap();
        assert!(h.store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_price_failure_skips_symbol_only() {
        let h = Harness::new();
        h.exchange.set_price("AAA-USDC", dec!(2));
        h.exchange.fail_pair("TEST-USDC");
        let mut portfolio = held(dec!(0.50), dec!(0.50), 0, Utc::now());
        portfolio.insert(
            "AAA".to_string(),
            Position::open(dec!(1.5), dec!(10), Decimal::ZERO, 2, Utc::now()),
        );
        let mut engine = h.engine(&["TEST", "AAA"], portfolio);

        let summary = engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(engine.portfolio().get("AAA").unwrap().highest_price_seen, dec!(2));
        assert!(engine.portfolio().is_held("TEST"));

        h.exchange.recover_pair("TEST-USDC");
        h.exchange.set_price("TEST-USDC", dec!(0.52));
        let summary = engine.evaluate_held_positions(Utc::now()).await;

        assert_eq!(summary.failed, 0);
        assert_eq!(engine.portfolio().get("TEST").unwrap().highest_price_seen, dec!(0.52));
    }

    #[tokio::test]
    async fn test_manual_sell() {
        let h = Harness::new();
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.50), 0, Utc::now()));

        assert_ok!(engine.sell("TEST").await);
        assert!(engine.portfolio().is_empty());

        let err = assert_err!(engine.sell("TEST").await);
        assert!(matches!(err, TradeError::NotHeld(_)));
    }

    #[tokio::test]
    async fn test_failed_sell_keeps_position() {
        let h = Harness::new();
        h.exchange.fail_orders(true);
        let mut engine = h.engine(&["TEST"], held(dec!(0.50), dec!(0.50), 0, Utc::now()));

        let err = assert_err!(engine.sell("TEST").await);

        assert!(matches!(err, TradeError::Exchange(_)));
        assert!(engine.portfolio().is_held("TEST"));
    }

    #[tokio::test]
    async fn test_sell_rounds_toward_zero() {
        let h = Harness::new();
        let mut portfolio = Portfolio::default();
        portfolio.insert(
            "TEST".to_string(),
            Position::open(dec!(0.50), dec!(12.3456), Decimal::ZERO, 2, Utc::now()),
        );
        let mut engine = h.engine(&["TEST"], portfolio);

        engine.sell("TEST").await.unwrap();

        assert_eq!(h.exchange.orders()[0].size, dec!(12.34));
    }
}
