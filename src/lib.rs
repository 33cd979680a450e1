//! Stocker - incremental market data ETL
//!
//! Harvests stock listings, daily candles and company profiles from a
//! rate-limited market data API, lands them as raw payloads, stages them
//! into canonical tables with change-aware upserts, and maintains trailing
//! 52-week aggregates for the candles each run touched.

pub mod config;
pub mod db;
pub mod error;
pub mod payload;
pub mod services;
pub mod sources;
pub mod transform;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stocker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
