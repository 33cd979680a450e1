//! Market data sources

pub mod finnhub;
pub mod types;

use crate::error::Result;
use async_trait::async_trait;
use types::*;

/// Source of listings, candles and profiles.
///
/// Implementations report HTTP 429 as `AppError::RateLimited` so the
/// retry layer can treat it as a quiet, expected condition.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Source ID (e.g., "finnhub")
    fn id(&self) -> &'static str;

    /// All instruments listed on an exchange
    async fn stocks(&self, exchange: &str) -> Result<Vec<Stock>>;

    /// Candle series for one instrument and window
    async fn candles(&self, request: &CandlesRequest) -> Result<StockCandles>;

    /// Company profile for one instrument
    async fn company_profile(&self, symbol: &str) -> Result<CompanyProfile>;
}

pub use finnhub::FinnhubClient;
