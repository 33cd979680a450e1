//! Stocker command line
//!
//! ```text
//! stocker etl [--config PATH] [--skip N] [--limit N]
//! stocker migrate [--config PATH]
//! ```
//!
//! The config path defaults to `$STOCKER_CONFIG`, then `stocker.json`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stocker::config::Config;
use stocker::db::SqliteDb;
use stocker::services::EtlService;
use stocker::sources::FinnhubClient;

const CONFIG_ENV: &str = "STOCKER_CONFIG";
const DEFAULT_CONFIG: &str = "stocker.json";

#[derive(Parser)]
#[command(name = "stocker", about = "Incremental market data ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one extraction and staging pass
    Etl {
        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stocks to skip from the start of the listing
        #[arg(short, long)]
        skip: Option<usize>,

        /// Max stocks to process after --skip; 0 means all
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Create or upgrade the database schema
    Migrate {
        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Command line flags win over the config file
fn apply_overrides(config: &mut Config, skip: Option<usize>, limit: Option<usize>) {
    if let Some(skip) = skip {
        config.skip = skip;
    }
    if let Some(limit) = limit {
        config.limit = limit;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stocker::init_tracing();

    match Cli::parse().command {
        Commands::Migrate { config } => {
            let config = load_config(&config_path(config))?;
            SqliteDb::open(&config.data_source, &config.pool)
                .context("opening database")?;
            tracing::info!("Database is up to date");
        }
        Commands::Etl { config, skip, limit } => {
            let mut config = load_config(&config_path(config))?;
            apply_overrides(&mut config, skip, limit);
            config.validate()?;
            let config = Arc::new(config);

            let db = Arc::new(
                SqliteDb::open(&config.data_source, &config.pool).context("opening database")?,
            );
            let source = Arc::new(FinnhubClient::new(&config.api.base_url, config.api_key()?)?);

            let summary = EtlService::new(config.clone(), db, source)
                .run()
                .await
                .context("job run failed")?;
            tracing::info!(
                "Run {} done: {} candles staged ({} modified), {} aggregates modified",
                summary.job_run_id,
                summary.candles.rows_staged,
                summary.candles.rows_modified,
                summary.candles_52wk.rows_modified
            );
        }
    }

    Ok(())
}
