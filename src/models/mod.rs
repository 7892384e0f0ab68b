//! Data models for held positions and the portfolio.

mod portfolio;
mod position;

pub use portfolio::Portfolio;
pub use position::Position;
