//! Collaborator contracts the strategy engine trades through.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Result of an order that reached the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    Filled { order_id: String },
    Rejected { reason: String },
}

/// Failure talking to the exchange. Always transient from the engine's point of view.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request to {endpoint} failed")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("exchange credentials are not configured")]
    MissingCredentials,

    #[error("invalid exchange credentials: {0}")]
    InvalidCredentials(String),
}

impl ExchangeError {
    pub fn decode(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Transport { .. } => true,
            ExchangeError::Status { status, .. } => *status == 429 || *status >= 500,
            ExchangeError::Decode { .. }
            | ExchangeError::MissingCredentials
            | ExchangeError::InvalidCredentials(_) => false,
        }
    }
}

/// Market data for trading pairs such as `BTC-USDC`.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Last traded price.
    async fn current_price(&self, pair: &str) -> Result<Decimal, ExchangeError>;

    /// Price change over the last 24 hours, in percent.
    async fn percent_change_24h(&self, pair: &str) -> Result<Decimal, ExchangeError>;

    /// Decimal places allowed for the base-asset order size.
    async fn lot_precision(&self, pair: &str) -> Result<u32, ExchangeError>;

    /// Available balance of `currency`.
    async fn quote_balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;
}

/// Market order placement.
#[async_trait]
pub trait OrderExecution: Send + Sync {
    /// Place a market order for `size` units of the base asset.
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<OrderOutcome, ExchangeError>;
}

/// Trading pair for a base symbol, e.g. `BTC` + `USDC` -> `BTC-USDC`.
pub fn trading_pair(symbol: &str, quote: &str) -> String {
    format!("{}-{}", symbol, quote)
}
