//! Finnhub wire shapes
//!
//! These mirror the vendor's JSON and are also the v1 schema of the
//! landing payloads, so changing a field here is a payload version bump.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listed instrument (`/stock/symbol`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stock {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub display_symbol: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Rectangular candle series (`/stock/candle`)
///
/// Arrays are parallel; `s` is `"ok"` or `"no_data"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockCandles {
    #[serde(default)]
    pub t: Vec<i64>,
    #[serde(default)]
    pub o: Vec<Option<f64>>,
    #[serde(default)]
    pub h: Vec<Option<f64>>,
    #[serde(default)]
    pub l: Vec<Option<f64>>,
    #[serde(default)]
    pub c: Vec<Option<f64>>,
    #[serde(default)]
    pub v: Vec<Option<f64>>,
    #[serde(default)]
    pub s: String,
}

/// Company profile (`/stock/profile2`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyProfile {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub ipo: String,
    #[serde(default)]
    pub market_capitalization: Option<f64>,
    #[serde(default)]
    pub share_outstanding: Option<f64>,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, rename = "weburl")]
    pub web_url: String,
    #[serde(default)]
    pub finnhub_industry: String,
}

/// Candle request window, kept with the response in the landing payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandlesRequest {
    pub symbol: String,
    pub resolution: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Candle response together with the request that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandlesResponse {
    pub request: CandlesRequest,
    pub response: StockCandles,
}
