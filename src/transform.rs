//! Vendor record to canonical row mapping
//!
//! Everything here is pure. Rejections are returned as `TransformError`
//! and it is up to the caller whether a rejection is skipped or fatal.

use crate::db::sqlite::models::{Candle, CompanyProfile, Stock};
use crate::error::TransformError;
use crate::sources::types as wire;
use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;

/// Map a listed instrument
pub fn stock(input: wire::Stock) -> Result<Stock, TransformError> {
    if input.symbol.trim().is_empty() {
        return Err(TransformError::MissingSymbol);
    }

    Ok(Stock {
        symbol: input.symbol,
        display_symbol: input.display_symbol,
        description: input.description,
    })
}

/// Map a parallel-array candle series into rows in `tz`
pub fn candles(
    symbol: &str,
    input: &wire::StockCandles,
    tz: &Tz,
) -> Result<Vec<Candle>, TransformError> {
    let len = input.t.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    let fields: [(&'static str, usize); 5] = [
        ("open", input.o.len()),
        ("high", input.h.len()),
        ("low", input.l.len()),
        ("close", input.c.len()),
        ("volume", input.v.len()),
    ];
    if let Some((field, actual)) = fields.into_iter().find(|(_, n)| *n != len) {
        return Err(TransformError::LengthMismatch {
            symbol: symbol.to_string(),
            field,
            expected: len,
            actual,
        });
    }

    input
        .t
        .iter()
        .enumerate()
        .map(|(i, &secs)| {
            let timestamp = tz.timestamp_opt(secs, 0).single().ok_or_else(|| {
                TransformError::InvalidTimestamp {
                    symbol: symbol.to_string(),
                    value: secs,
                }
            })?;

            Ok(Candle {
                symbol: symbol.to_string(),
                timestamp,
                open: input.o[i],
                high: input.h[i],
                low: input.l[i],
                close: input.c[i],
                volume: input.v[i],
            })
        })
        .collect()
}

/// Map a company profile fetched for `symbol`
pub fn company_profile(
    symbol: &str,
    input: wire::CompanyProfile,
) -> Result<CompanyProfile, TransformError> {
    if input.ticker.trim().is_empty() {
        return Err(TransformError::MissingTicker {
            symbol: symbol.to_string(),
        });
    }

    let ipo = match input.ipo.trim() {
        "" => None,
        raw => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            TransformError::InvalidDate {
                symbol: symbol.to_string(),
                field: "ipo",
                value: raw.to_string(),
            }
        })?),
    };

    Ok(CompanyProfile {
        symbol: symbol.to_string(),
        country: non_empty(input.country),
        currency: non_empty(input.currency),
        exchange: non_empty(input.exchange),
        name: non_empty(input.name),
        ticker: input.ticker,
        ipo,
        market_capitalization: input.market_capitalization,
        shares_outstanding: input.share_outstanding,
        logo: non_empty(input.logo),
        phone: non_empty(input.phone),
        web_url: non_empty(input.web_url),
        industry: non_empty(input.finnhub_industry),
    })
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
