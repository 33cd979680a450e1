//! Finnhub REST adapter

use crate::error::{AppError, Result};
use crate::sources::types::*;
use crate::sources::MarketDataSource;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://finnhub.io/api/v1/";

/// Finnhub client.
///
/// Per-call timeouts are applied by the caller's retry layer, so the
/// underlying `reqwest::Client` is built without one.
pub struct FinnhubClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl FinnhubClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("Invalid API base URL {:?}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client: Client::new(),
            base_url,
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::Config(format!("Invalid endpoint {:?}: {}", path, e)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.endpoint(path)?;
        tracing::debug!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(url)
            .header("X-Finnhub-Token", &self.api_key)
            .query(query)
            .send()
            .await?;

        let response = check_status(path, response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Map non-success statuses, keeping 429 distinct from other failures
async fn check_status(path: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AppError::RateLimited(format!("{} returned {}", path, status)));
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {}>", e));

    Err(AppError::Upstream {
        status: status.as_u16(),
        message: format!("{} ({})", path, body.trim()),
    })
}

#[async_trait]
impl MarketDataSource for FinnhubClient {
    fn id(&self) -> &'static str {
        "finnhub"
    }

    async fn stocks(&self, exchange: &str) -> Result<Vec<Stock>> {
        self.get("stock/symbol", &[("exchange", exchange.to_string())])
            .await
    }

    async fn candles(&self, request: &CandlesRequest) -> Result<StockCandles> {
        self.get(
            "stock/candle",
            &[
                ("symbol", request.symbol.clone()),
                ("resolution", request.resolution.clone()),
                ("from", request.from.timestamp().to_string()),
                ("to", request.to.timestamp().to_string()),
            ],
        )
        .await
    }

    async fn company_profile(&self, symbol: &str) -> Result<CompanyProfile> {
        self.get("stock/profile2", &[("symbol", symbol.to_string())])
            .await
    }
}
