//! Bot coordinator: runs the two periodic jobs against one shared engine.
//!
//! Handles:
//! - Candidate scans and held-position passes on staggered intervals
//! - Manual sells through the same engine lock
//! - Publishing a read-only snapshot after every job for the console
//! - Graceful shutdown with a bounded wait

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{DisplayZone, ScheduleConfig};
use crate::models::Portfolio;
use crate::trading::{EngineStats, Strategy, StrategyEngine, TradeError};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub schedule: ScheduleConfig,

    /// Whether orders go to the simulated exchange
    pub dry_run: bool,

    /// Zone for timestamps in the status table
    pub time_zone: DisplayZone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Candidates,
    HeldPositions,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Candidates => "candidates",
            Job::HeldPositions => "held-positions",
        }
    }
}

/// Main bot coordinator.
pub struct Bot {
    config: BotConfig,
    engine: Arc<Mutex<StrategyEngine>>,
    snapshot: Arc<RwLock<Snapshot>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Bot {
    pub fn new(engine: StrategyEngine, config: BotConfig) -> Self {
        let snapshot = Snapshot::capture(&engine, &config);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            engine: Arc::new(Mutex::new(engine)),
            snapshot: Arc::new(RwLock::new(snapshot)),
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn both periodic jobs. The held-position job starts `staggerSecs` after the
    /// candidate job.
    pub fn start(&mut self) {
        let schedule = &self.config.schedule;
        info!(
            candidate_interval = schedule.candidate_interval_secs,
            held_interval = schedule.held_position_interval_secs,
            stagger = schedule.stagger_secs,
            dry_run = self.config.dry_run,
            "Starting bot"
        );

        let now = Instant::now();
        let jobs = [
            (Job::Candidates, now, schedule.candidate_interval()),
            (
                Job::HeldPositions,
                now + schedule.stagger(),
                schedule.held_position_interval(),
            ),
        ];

        for (job, start, period) in jobs {
            let engine = self.engine.clone();
            let snapshot = self.snapshot.clone();
            let config = self.config.clone();
            let shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(run_job(
                job, start, period, engine, snapshot, config, shutdown,
            )));
        }
    }

    /// Sell a held position now. Waits for any running job to finish first.
    pub async fn sell(&self, symbol: &str) -> Result<(), TradeError> {
        let mut engine = self.engine.lock().await;
        let result = engine.sell(symbol).await;
        publish(&engine, &self.snapshot, &self.config).await;
        result
    }

    /// Last published snapshot. May lag a job that is currently running.
    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.read().await.clone()
    }

    /// Signal the jobs to stop, wait up to the grace period, then abort stragglers.
    pub async fn shutdown(mut self) {
        info!("Shutting down bot...");
        let _ = self.shutdown.send(true);

        let grace = self.config.schedule.shutdown_grace();
        if tokio::time::timeout(grace, join_all(self.handles.iter_mut()))
            .await
            .is_err()
        {
            warn!(grace_secs = grace.as_secs(), "Jobs did not stop in time, aborting");
            for handle in &self.handles {
                handle.abort();
            }
        }

        let snapshot = self.snapshot.read().await;
        info!(positions = snapshot.portfolio.len(), "Bot shutdown complete");
    }
}

async fn run_job(
    job: Job,
    start: Instant,
    period: Duration,
    engine: Arc<Mutex<StrategyEngine>>,
    snapshot: Arc<RwLock<Snapshot>>,
    config: BotConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let mut engine = engine.lock().await;
        let now = Utc::now();
        debug!(job = job.name(), "Job tick");

        match job {
            Job::Candidates => match engine.evaluate_initial_purchase(now).await {
                Ok(Some(symbol)) => info!(symbol = %symbol, "New position opened"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Candidate purchase failed, retrying next cycle"),
            },
            Job::HeldPositions => {
                let summary = engine.evaluate_held_positions(now).await;
                if summary.averaged_down + summary.sold + summary.failed > 0 {
                    info!(
                        evaluated = summary.evaluated,
                        averaged_down = summary.averaged_down,
                        sold = summary.sold,
                        failed = summary.failed,
                        "Held positions evaluated"
                    );
                }
            }
        }

        publish(&engine, &snapshot, &config).await;
    }

    debug!(job = job.name(), "Job stopped");
}

async fn publish(engine: &StrategyEngine, snapshot: &RwLock<Snapshot>, config: &BotConfig) {
    let next = Snapshot::capture(engine, config);
    *snapshot.write().await = next;
}

/// Read-only copy of the portfolio for display.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub portfolio: Portfolio,
    pub prices: BTreeMap<String, Decimal>,
    pub stats: Option<EngineStats>,
    pub strategy: Strategy,
    pub taken_at: DateTime<Utc>,
    pub dry_run: bool,
    pub time_zone: DisplayZone,
}

impl Snapshot {
    pub fn capture(engine: &StrategyEngine, config: &BotConfig) -> Self {
        Self {
            portfolio: engine.portfolio().clone(),
            prices: engine.last_prices().clone(),
            stats: Some(engine.stats().clone()),
            strategy: engine.strategy().clone(),
            taken_at: Utc::now(),
            dry_run: config.dry_run,
            time_zone: config.time_zone,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = &self.strategy.config().quote_currency;
        let fee_pct = self.strategy.config().taker_fee_percentage;

        writeln!(
            f,
            "=== Positions ({}) {} ===",
            self.time_zone.format(self.taken_at, "%Y-%m-%d %H:%M:%S"),
            if self.dry_run { "(Dry Run)" } else { "" }
        )?;

        if self.portfolio.is_empty() {
            writeln!(f, "No positions held.")?;
        } else {
            writeln!(
                f,
                "{:<8} {:<16} {:>5} {:>14} {:>14} {:>9} {:>14} {:>12} {:>12} {:>8} {:>4}",
                "SYMBOL", "PURCHASED", "DAYS", "AVG PRICE", "HIGHEST", "HIGH %", "CURRENT", "VALUE", "NET", "NET %", "STEP"
            )?;
            writeln!(f, "{}", "-".repeat(126))?;

            let mut total_value = Decimal::ZERO;
            let mut total_net = Decimal::ZERO;
            for (symbol, position) in &self.portfolio.positions {
                let armed = if self.strategy.is_profit_armed(position) { "*" } else { " " };
                let purchased = self.time_zone.format(position.opened_at, "%Y-%m-%d %H:%M");

                let (current, value, net, net_pct) = match self.prices.get(symbol) {
                    Some(price) => {
                        let value = position.value_at(*price);
                        let net = position.net_win_loss(*price, fee_pct);
                        let cost = position.invested() + position.accumulated_fees;
                        let net_pct = if cost.is_zero() {
                            Decimal::ZERO
                        } else {
                            net / cost * Decimal::ONE_HUNDRED
                        };
                        total_value += value;
                        total_net += net;
                        (
                            format!("{:.6}", price),
                            format!("{:.2}", value),
                            format!("{:.2}", net),
                            format!("{:.2}%", net_pct),
                        )
                    }
                    None => ("-".into(), "-".into(), "-".into(), "-".into()),
                };

                writeln!(
                    f,
                    "{:<8} {:<16} {:>5} {:>14.6} {:>14.6} {:>8.2}{} {:>14} {:>12} {:>12} {:>8} {:>4}",
                    symbol,
                    purchased,
                    position.days_held(self.taken_at),
                    position.average_purchase_price,
                    position.highest_price_seen,
                    position.highest_performance_pct(),
                    armed,
                    current,
                    value,
                    net,
                    net_pct,
                    position.average_down_step,
                )?;
            }

            writeln!(f, "{}", "-".repeat(126))?;
            writeln!(
                f,
                "Held: {}  Invested: {:.2} {}  Value: {:.2} {}  Net: {:.2} {}",
                self.portfolio.len(),
                self.portfolio.holdings_at_cost(),
                quote,
                total_value,
                quote,
                total_net,
                quote
            )?;
            writeln!(f, "* highest gain is above the profit-protection threshold")?;
        }

        if let Some(stats) = &self.stats {
            writeln!(f)?;
            writeln!(f, "Cash:            {:.2} {}", self.portfolio.cash, quote)?;
            writeln!(f, "Realized P&L:    {:.2} {}", stats.realized_pnl, quote)?;
            writeln!(
                f,
                "Trades:          {} buys, {} average-downs, {} sells ({} rejected)",
                stats.initial_buys, stats.average_downs, stats.sells, stats.rejected_orders
            )?;
            writeln!(f, "Failed checks:   {}", stats.failed_evaluations)?;
            for (label, at) in [
                ("Last scan:", stats.last_candidate_run),
                ("Last check:", stats.last_held_run),
            ] {
                let shown = at
                    .map(|t| self.time_zone.format(t, "%Y-%m-%d %H:%M:%S"))
                    .unwrap_or_else(|| "never".to_string());
                writeln!(f, "{:<16} {}", label, shown)?;
            }
        }

        Ok(())
    }
}
