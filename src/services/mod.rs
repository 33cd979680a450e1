//! Services Layer
//!
//! Run orchestration on top of the storage layer and the market data
//! source.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──> candles worker ──┐
//! stocks worker ────────┤                     ├──> SqliteDb (spawn_blocking)
//!                       └──> profiles worker ─┘
//!        all workers ──> Throttle ──> MarketDataSource
//! ```
//!
//! # Services
//!
//! - `EtlService` - One job run end to end
//! - `Throttle` - Shared request clock
//! - `retry` / `retry_db` - Categorized backoff for external and database calls
//! - `RunScope` - Cancellation shared by the workers of a run

pub mod etl_service;
pub mod retry;
pub mod scope;
pub mod throttle;

pub use etl_service::{extraction_window, EtlService, RunSummary};
pub use retry::{retry, retry_db, CallCost};
pub use scope::RunScope;
pub use throttle::Throttle;
