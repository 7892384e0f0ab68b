//! Durable storage of the position table.
//!
//! The whole portfolio is written as one JSON document after every mutation:
//!
//! ```json
//! { "positions": { "BTC": { "averagePurchasePrice": "0.5", ... } } }
//! ```
//!
//! A missing file means an empty portfolio. Any other read or parse failure is
//! returned to the caller, which must refuse to start trading.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::models::Portfolio;

/// Errors from loading or saving the position file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read position file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("position file {path} is not valid")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode positions")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write position file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// JSON file backing the portfolio.
#[derive(Debug, Clone)]
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the portfolio, treating a missing file as empty.
    pub async fn load(&self) -> Result<Portfolio, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No position file found, starting empty");
                return Ok(Portfolio::default());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let portfolio = decode(&bytes).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;

        info!(
            path = %self.path.display(),
            positions = portfolio.len(),
            "Loaded positions"
        );
        Ok(portfolio)
    }

    /// Write the portfolio through a temp file and rename it into place.
    pub async fn save(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        let bytes = encode(portfolio).map_err(StoreError::Encode)?;
        let tmp = self.tmp_path();

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), positions = portfolio.len(), "Saved positions");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "positions.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Serialize a portfolio into its file representation.
pub fn encode(portfolio: &Portfolio) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(portfolio)
}

/// Parse a portfolio from its file representation.
pub fn decode(bytes: &[u8]) -> Result<Portfolio, serde_json::Error> {
    serde_json::from_slice(bytes)
}
