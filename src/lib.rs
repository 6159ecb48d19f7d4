pub mod cache;
pub mod cancel;
pub mod config;
pub mod correlation;
pub mod error;
pub mod export;
pub mod indicators;
pub mod loader;
pub mod matrix;
pub mod pipeline;
pub mod predictor;
pub mod rankings;
pub mod records;
pub mod relative_strength;
pub mod source;
pub mod store;
pub mod summary;

use clap::Args;
use std::path::PathBuf;

/// Rebuild `rolling_correlation_long` for every pair and window.
#[derive(Args, Debug, Clone, Default)]
pub struct CorrelationArgs {
    /// Tickers, in the column order used for pair labels
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub tickers: Option<Vec<String>>,

    /// Rolling windows (days)
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub windows: Option<Vec<usize>>,

    /// Start date (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub start: Option<String>,

    /// End date (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub end: Option<String>,

    /// SQLite URL (or set CORRELATION_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Also write long and wide CSV exports into this directory
    #[arg(long)]
    pub export_dir: Option<PathBuf>,
}

/// Rebuild `relative_strength_long` and `asset_prices`.
#[derive(Args, Debug, Clone, Default)]
pub struct StrengthArgs {
    /// Tickers, in the column order used for Base/Quote
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub tickers: Option<Vec<String>>,

    /// Smoothing windows (days)
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub windows: Option<Vec<usize>>,

    /// Start date (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub start: Option<String>,

    /// End date (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub end: Option<String>,

    /// SQLite URL (or set STRENGTH_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,
}

/// Data provider options.
#[derive(Args, Debug, Clone, Default)]
pub struct FetchArgs {
    /// Concurrent ticker fetches
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-request timeout (seconds)
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Retries for transient provider errors before the run fails
    #[arg(long)]
    pub max_retries: Option<usize>,

    /// First retry delay (ms); doubles on every further attempt
    #[arg(long)]
    pub retry_base_ms: Option<u64>,

    /// Read `{TICKER}.csv` files from this directory instead of Yahoo Finance
    #[arg(long)]
    pub csv_dir: Option<PathBuf>,
}

/// Run control shared by the batch commands.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Wall-clock budget (seconds); the job is cancelled before writing if exceeded
    #[arg(long)]
    pub budget_secs: Option<u64>,

    /// Optional lock file path to prevent concurrent writers
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

/// Both jobs with their default universes.
#[derive(Args, Debug, Clone, Default)]
pub struct AllArgs {
    /// Start date (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub start: Option<String>,

    /// End date (inclusive), format YYYY-MM-DD
    #[arg(long)]
    pub end: Option<String>,

    /// SQLite URL for the correlation job
    #[arg(long)]
    pub correlation_database_url: Option<String>,

    /// SQLite URL for the relative-strength job
    #[arg(long)]
    pub strength_database_url: Option<String>,

    /// Also write correlation CSV exports into this directory
    #[arg(long)]
    pub export_dir: Option<PathBuf>,
}

/// Rankings over the persisted tables.
#[derive(Args, Debug, Clone, Default)]
pub struct RankArgs {
    /// Lookback for gainers/losers (days)
    #[arg(long)]
    pub period_days: Option<i64>,

    /// Rows per ranking
    #[arg(long)]
    pub top: Option<usize>,

    /// Window for the correlation and relative-strength rankings
    #[arg(long)]
    pub window: Option<u32>,

    /// Restrict correlation rankings to pairs containing this asset
    #[arg(long)]
    pub asset: Option<String>,

    #[arg(long)]
    pub correlation_database_url: Option<String>,

    #[arg(long)]
    pub strength_database_url: Option<String>,
}

/// Versioned JSON summary of the latest data.
#[derive(Args, Debug, Clone, Default)]
pub struct SummaryArgs {
    /// Rows per section
    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub correlation_database_url: Option<String>,

    #[arg(long)]
    pub strength_database_url: Option<String>,
}

/// Probability of a next-day rise from a serialized logistic model.
#[derive(Args, Debug, Clone, Default)]
pub struct PredictArgs {
    /// Model JSON file
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Ticker to score
    #[arg(long)]
    pub ticker: Option<String>,

    #[arg(long)]
    pub strength_database_url: Option<String>,
}

/// Latest date stored in each table.
#[derive(Args, Debug, Clone, Default)]
pub struct LastUpdateArgs {
    #[arg(long)]
    pub correlation_database_url: Option<String>,

    #[arg(long)]
    pub strength_database_url: Option<String>,
}
