//! Coinbase Advanced Trade REST client.
//!
//! Product data is read from the public market endpoints. Balances and orders carry a
//! short-lived ES256 JWT signed with the CDP API key, one token per request. Reads are
//! retried with exponential backoff on transport errors and 5xx/429 responses. Order
//! placement is never retried, since a timed-out POST may still have been accepted.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p256::SecretKey;
use reqwest::{Client, Method, RequestBuilder, Url};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::exchange::{ExchangeError, MarketData, OrderExecution, OrderOutcome, OrderSide};
use super::types::*;

pub const COINBASE_URL: &str = "https://api.coinbase.com";
const API_PREFIX: &str = "/api/v3/brokerage";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(20);
const ACCOUNTS_PAGE_SIZE: u32 = 250;
const JWT_ISSUER: &str = "cdp";
const JWT_LIFETIME_SECS: i64 = 120;

/// CDP API key: the key name (`organizations/{org}/apiKeys/{id}`) and its EC private key.
#[derive(Clone)]
pub struct Credentials {
    pub key_name: String,
    signing_key: EncodingKey,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key_name", &self.key_name)
            .field("signing_key", &"***")
            .finish()
    }
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
    nonce: String,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    sub: &'a str,
    iss: &'static str,
    nbf: i64,
    exp: i64,
    uri: String,
}

impl Credentials {
    /// Parse a P-256 private key given as SEC1 (`EC PRIVATE KEY`) or PKCS#8 PEM.
    pub fn new(key_name: &str, private_key_pem: &str) -> Result<Self, ExchangeError> {
        // Keys copied into .env files often carry escaped newlines
        let pem = private_key_pem.replace("\\n", "\n");
        let pem = pem.trim();
        let secret = if pem.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(pem)
                .map_err(|e| ExchangeError::InvalidCredentials(e.to_string()))?
        } else {
            SecretKey::from_pkcs8_pem(pem)
                .map_err(|e| ExchangeError::InvalidCredentials(e.to_string()))?
        };
        let der = secret
            .to_pkcs8_der()
            .map_err(|e| ExchangeError::InvalidCredentials(e.to_string()))?;

        Ok(Self {
            key_name: key_name.to_string(),
            signing_key: EncodingKey::from_ec_der(der.as_bytes()),
        })
    }

    /// Read `COINBASE_API_KEY` (key name) and `COINBASE_API_SECRET` (PEM private key).
    ///
    /// Returns `Ok(None)` when either is unset, and an error when the key does not parse.
    pub fn from_env() -> Result<Option<Self>, ExchangeError> {
        let key_name = std::env::var("COINBASE_API_KEY").unwrap_or_default();
        let private_key = std::env::var("COINBASE_API_SECRET").unwrap_or_default();
        if key_name.is_empty() || private_key.is_empty() {
            return Ok(None);
        }
        Self::new(&key_name, &private_key).map(Some)
    }

    /// Bearer token for one request. `uri` is `"{METHOD} {host}{path}"`.
    fn token(&self, uri: String, now: i64) -> Result<String, ExchangeError> {
        let header = JwtHeader {
            alg: "ES256",
            typ: "JWT",
            kid: &self.key_name,
            nonce: hex::encode(uuid::Uuid::new_v4().as_bytes()),
        };
        let claims = JwtClaims {
            sub: &self.key_name,
            iss: JWT_ISSUER,
            nbf: now,
            exp: now + JWT_LIFETIME_SECS,
            uri,
        };

        let message = format!("{}.{}", jwt_segment(&header)?, jwt_segment(&claims)?);
        let signature = jsonwebtoken::crypto::sign(message.as_bytes(), &self.signing_key, Algorithm::ES256)
            .map_err(|e| ExchangeError::InvalidCredentials(e.to_string()))?;
        Ok(format!("{}.{}", message, signature))
    }
}

/// Client for the Coinbase Advanced Trade API.
pub struct CoinbaseClient {
    http: Client,
    base_url: String,
    /// `host[:port]` of `base_url`, as the JWT `uri` claim expects it
    authority: String,
    credentials: Option<Credentials>,
}

impl CoinbaseClient {
    /// Create a client. Without credentials only the public market endpoints work.
    pub fn new(base_url: &str, credentials: Option<Credentials>) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|source| ExchangeError::Transport {
                endpoint: base_url.to_string(),
                source,
            })?;

        let authority = Url::parse(base_url)
            .ok()
            .and_then(|url| {
                let host = url.host_str()?.to_string();
                Some(match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host,
                })
            })
            .ok_or_else(|| ExchangeError::decode(base_url, "base URL has no host"))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            authority,
            credentials,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Fetch one product record.
    pub async fn get_product(&self, pair: &str) -> Result<ProductResponse, ExchangeError> {
        let path = format!("{}/market/products/{}", API_PREFIX, pair);
        self.get_json(&path, &[], false).await
    }

    /// Available balance for `currency`, walking every accounts page.
    pub async fn get_available_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let path = format!("{}/accounts", API_PREFIX);
        let mut cursor = String::new();

        loop {
            let mut query = vec![("limit", ACCOUNTS_PAGE_SIZE.to_string())];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }

            let page: AccountsResponse = self.get_json(&path, &query, true).await?;
            if let Some(account) = page.accounts.iter().find(|a| a.currency == currency) {
                return parse_decimal(&path, &account.available_balance.value);
            }

            if !page.has_next || page.cursor.is_empty() {
                debug!(currency = %currency, "No account for currency, balance is zero");
                return Ok(Decimal::ZERO);
            }
            cursor = page.cursor;
        }
    }

    /// Submit a market IOC order sized in the base asset.
    pub async fn create_market_order(
        &self,
        pair: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<CreateOrderResponse, ExchangeError> {
        let path = format!("{}/orders", API_PREFIX);
        let request = CreateOrderRequest {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            product_id: pair.to_string(),
            side: side.as_str().to_string(),
            order_configuration: OrderConfiguration {
                market_market_ioc: MarketIoc {
                    base_size: size.normalize().to_string(),
                },
            },
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| ExchangeError::decode(&path, e))?;

        debug!(
            pair = %pair,
            side = side.as_str(),
            size = %size,
            client_order_id = %request.client_order_id,
            "Submitting market order"
        );

        let builder = self
            .request(Method::POST, &path, &[], true)?
            .header("Content-Type", "application/json")
            .body(body);
        self.send_json(&path, builder).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        signed: bool,
    ) -> Result<T, ExchangeError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(MAX_RETRY_ELAPSED))
            .build();

        backoff::future::retry(policy, || async move {
            let builder = self
                .request(Method::GET, path, query, signed)
                .map_err(backoff::Error::permanent)?;
            self.send_json(path, builder).await.map_err(|e| {
                if e.is_retryable() {
                    warn!(path = %path, error = %e, "Request failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        signed: bool,
    ) -> Result<RequestBuilder, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method.clone(), &url);
        if !query.is_empty() {
            builder = builder.query(query);
        }

        if signed {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or(ExchangeError::MissingCredentials)?;
            let uri = format!("{} {}{}", method.as_str(), self.authority, path);
            let token = credentials.token(uri, Utc::now().timestamp())?;
            builder = builder.bearer_auth(token);
        }

        Ok(builder)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        path: &str,
        builder: RequestBuilder,
    ) -> Result<T, ExchangeError> {
        let resp = builder.send().await.map_err(|source| ExchangeError::Transport {
            endpoint: path.to_string(),
            source,
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|source| ExchangeError::Transport {
            endpoint: path.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(ExchangeError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| ExchangeError::decode(path, e))
    }
}

#[async_trait]
impl MarketData for CoinbaseClient {
    async fn current_price(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        let product = self.get_product(pair).await?;
        parse_decimal(pair, &product.price)
    }

    async fn percent_change_24h(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        let product = self.get_product(pair).await?;
        parse_decimal(pair, &product.price_percentage_change_24h)
    }

    async fn lot_precision(&self, pair: &str) -> Result<u32, ExchangeError> {
        let product = self.get_product(pair).await?;
        increment_precision(&product.base_increment)
            .ok_or_else(|| ExchangeError::decode(pair, "missing or invalid base_increment"))
    }

    async fn quote_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        self.get_available_balance(currency).await
    }
}

#[async_trait]
impl OrderExecution for CoinbaseClient {
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<OrderOutcome, ExchangeError> {
        let response = self.create_market_order(pair, side, size).await?;

        if response.success {
            let order_id = response
                .success_response
                .map(|s| s.order_id)
                .unwrap_or_default();
            Ok(OrderOutcome::Filled { order_id })
        } else {
            Ok(OrderOutcome::Rejected {
                reason: response.rejection_reason(),
            })
        }
    }
}

fn jwt_segment<T: Serialize>(value: &T) -> Result<String, ExchangeError> {
    let json = serde_json::to_vec(value).map_err(|e| ExchangeError::InvalidCredentials(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn parse_decimal(endpoint: &str, raw: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| ExchangeError::decode(endpoint, format!("{:?} is not a number: {}", raw, e)))
}

/// Decimal places of an increment such as `"0.00010000"` (4) or `"1"` (0).
fn increment_precision(increment: &str) -> Option<u32> {
    let value = Decimal::from_str(increment.trim()).ok()?;
    if value <= Decimal::ZERO {
        return None;
    }
    Some(value.normalize().scale())
}
