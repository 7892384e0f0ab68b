//! Exchange access: collaborator traits, the Coinbase client and the dry-run exchange.

mod coinbase;
mod exchange;
mod paper;
mod types;

#[cfg(test)]
pub mod testing;

pub use coinbase::{CoinbaseClient, Credentials, COINBASE_URL};
pub use exchange::{
    trading_pair, ExchangeError, MarketData, OrderExecution, OrderOutcome, OrderSide,
};
pub use paper::PaperExchange;
