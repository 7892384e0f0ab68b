//! Wire types for the Coinbase Advanced Trade REST API.

use serde::{Deserialize, Serialize};

/// Product response from `/market/products/{product_id}`.
///
/// Numeric fields arrive as strings and may be empty for delisted products.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductResponse {
    pub product_id: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub price_percentage_change_24h: String,
    #[serde(default)]
    pub base_increment: String,
}

/// Page of accounts from `/accounts`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsResponse {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub cursor: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub currency: String,
    pub available_balance: Balance,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub value: String,
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderRequest {
    pub client_order_id: String,
    pub product_id: String,
    pub side: String,
    pub order_configuration: OrderConfiguration,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderConfiguration {
    pub market_market_ioc: MarketIoc,
}

/// Immediate-or-cancel market order sized in the base asset.
#[derive(Debug, Clone, Serialize)]
pub struct MarketIoc {
    pub base_size: String,
}

/// Response from `POST /orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderResponse {
    pub success: bool,
    #[serde(default)]
    pub success_response: Option<OrderSuccess>,
    #[serde(default)]
    pub error_response: Option<OrderFailure>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderSuccess {
    pub order_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFailure {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_details: String,
}

impl CreateOrderResponse {
    /// Human-readable rejection reason assembled from whatever fields are present.
    pub fn rejection_reason(&self) -> String {
        let mut parts = Vec::new();
        if let Some(err) = &self.error_response {
            for part in [&err.error, &err.message, &err.error_details] {
                if !part.is_empty() {
                    parts.push(part.clone());
                }
            }
        }
        if let Some(reason) = &self.failure_reason {
            if !reason.is_empty() {
                parts.push(reason.clone());
            }
        }
        if parts.is_empty() {
            "no reason given".to_string()
        } else {
            parts.join(": ")
        }
    }
}
