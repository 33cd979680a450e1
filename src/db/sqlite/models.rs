//! Canonical row types

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::AddAssign;

/// Entity families that flow through landing and staging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Stock,
    Candle,
    CompanyProfile,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Stock,
        EntityKind::Candle,
        EntityKind::CompanyProfile,
    ];

    /// Append-only landing table
    pub fn src_table(self) -> &'static str {
        match self {
            EntityKind::Stock => "src_stocks",
            EntityKind::Candle => "src_candles",
            EntityKind::CompanyProfile => "src_company_profiles",
        }
    }

    /// Canonical table
    pub fn stage_table(self) -> &'static str {
        match self {
            EntityKind::Stock => "stage_stocks",
            EntityKind::Candle => "stage_candles",
            EntityKind::CompanyProfile => "stage_company_profiles",
        }
    }

    /// Tag byte used by the payload envelope
    pub fn code(self) -> u8 {
        match self {
            EntityKind::Stock => 1,
            EntityKind::Candle => 2,
            EntityKind::CompanyProfile => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(EntityKind::Stock),
            2 => Some(EntityKind::Candle),
            3 => Some(EntityKind::CompanyProfile),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Stock => "stocks",
            EntityKind::Candle => "candles",
            EntityKind::CompanyProfile => "company_profiles",
        }
    }
}

/// Listed instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub symbol: String,
    pub display_symbol: String,
    pub description: String,
}

/// Daily OHLCV candle, timestamp in the configured zone
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Tz>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

/// Company profile, one per symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub symbol: String,
    pub country: Option<String>,
    pub currency: Option<String>,
    pub exchange: Option<String>,
    pub name: Option<String>,
    pub ticker: String,
    pub ipo: Option<NaiveDate>,
    pub market_capitalization: Option<f64>,
    pub shares_outstanding: Option<f64>,
    pub logo: Option<String>,
    pub phone: Option<String>,
    pub web_url: Option<String>,
    pub industry: Option<String>,
}

/// max/min/avg and non-null count of one field over a window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub avg: Option<f64>,
    pub count: i64,
}

/// Trailing 52-week aggregate for one candle
#[derive(Debug, Clone, PartialEq)]
pub struct Candle52Wk {
    pub symbol: String,
    pub timestamp: DateTime<Tz>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub high_52wk: WindowStats,
    pub low_52wk: WindowStats,
    pub volume_52wk: WindowStats,
    pub timestamp_52wk_count: i64,
}

/// Result of one staging pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagingInfo {
    /// Rows considered
    pub rows_staged: i64,
    /// Rows inserted or overwritten because a tracked field differed
    pub rows_modified: i64,
}

impl AddAssign for StagingInfo {
    fn add_assign(&mut self, rhs: Self) {
        self.rows_staged += rhs.rows_staged;
        self.rows_modified += rhs.rows_modified;
    }
}

/// Last landing row folded in by delta staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageWatermark {
    pub latest_id: i64,
    /// `created` of that row
    pub latest_modification: String,
}

/// Result of a delta-by-watermark staging pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaStagingInfo {
    pub rows_affected: i64,
    /// Watermark as it stood before this pass
    pub previous_latest_modification: Option<String>,
}

/// Landed payload
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub id: i64,
    pub job_run_id: i64,
    pub symbol: String,
    pub payload: Vec<u8>,
    pub created: String,
}

/// Lifecycle state of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobRunStatus {
    Running,
    Succeeded,
    Failed,
}

/// One pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub job_definition_id: i64,
    pub success: Option<bool>,
    pub started: String,
    pub finished: Option<String>,
}

impl JobRun {
    pub fn status(&self) -> JobRunStatus {
        match self.success {
            None => JobRunStatus::Running,
            Some(true) => JobRunStatus::Succeeded,
            Some(false) => JobRunStatus::Failed,
        }
    }
}

/// Latest successfully staged candle per symbol
pub type LatestCandles = HashMap<String, DateTime<Tz>>;
