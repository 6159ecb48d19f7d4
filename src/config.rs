use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;

use crate::{CorrelationArgs, FetchArgs, StrengthArgs};

pub const CORRELATION_TICKERS: &[&str] = &[
    "BTC-USD", "ETH-USD", "SOL-USD", "BNB-USD", "DOT-USD", "AVAX-USD", "LTC-USD", "XRP-USD",
    "TRX-USD", "ADA-USD", "LINK-USD", "XLM-USD", "AAVE-USD", "HBAR-USD", "BCH-USD", "NEAR-USD",
    "ALGO-USD", "ATOM-USD", "ARB-USD", "TIA-USD", "OP-USD", "IOTA-USD",
];
pub const CORRELATION_WINDOWS: &[usize] = &[7, 15, 30, 60, 90];

pub const STRENGTH_TICKERS: &[&str] = &[
    "BTC-USD", "ETH-USD", "SOL-USD", "BNB-USD", "DOT-USD", "AVAX-USD", "XRP-USD", "AAVE-USD",
    "TRX-USD", "ADA-USD", "LINK-USD",
];
pub const STRENGTH_WINDOWS: &[usize] = &[3, 7, 14, 20, 30];

pub const DEFAULT_START: &str = "2010-01-01";
pub const DEFAULT_END: &str = "2030-01-01";

pub const CORRELATION_DB_ENV: &str = "CORRELATION_DATABASE_URL";
pub const STRENGTH_DB_ENV: &str = "STRENGTH_DATABASE_URL";
pub const DEFAULT_CORRELATION_DB: &str = "sqlite://correlation.db";
pub const DEFAULT_STRENGTH_DB: &str = "sqlite://performance.db";

#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout_secs: 30,
            max_retries: 4,
            retry_base_ms: 500,
        }
    }
}

/// Universe, range and windows shared by both jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct UniverseSettings {
    pub tickers: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub windows: Vec<usize>,
    pub database_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationSettings {
    pub universe: UniverseSettings,
    pub export_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrengthSettings {
    pub universe: UniverseSettings,
}

pub fn parse_date(s: &str, flag: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid --{} {}", flag, s))
}

fn database_url(arg: Option<String>, env_key: &str, default: &str) -> String {
    arg.or_else(|| env::var(env_key).ok())
        .unwrap_or_else(|| default.to_string())
}

fn validate_windows(windows: &[usize], min: usize) -> Result<Vec<usize>> {
    if windows.is_empty() {
        bail!("at least one window is required");
    }
    let mut out: Vec<usize> = Vec::with_capacity(windows.len());
    for &w in windows {
        if w < min {
            bail!("window {} is below the minimum of {}", w, min);
        }
        if !out.contains(&w) {
            out.push(w);
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn universe(
    tickers: Option<Vec<String>>,
    default_tickers: &[&str],
    start: Option<String>,
    end: Option<String>,
    windows: Option<Vec<usize>>,
    default_windows: &[usize],
    min_window: usize,
    database_url: String,
) -> Result<UniverseSettings> {
    let tickers = tickers
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| default_tickers.iter().map(|t| t.to_string()).collect());
    let mut unique: Vec<String> = Vec::with_capacity(tickers.len());
    for t in tickers {
        let t = t.trim().to_uppercase();
        if !t.is_empty() && !unique.contains(&t) {
            unique.push(t);
        }
    }
    if unique.iter().any(|t| t.contains('/')) {
        bail!("tickers must not contain '/' (used as the pair separator)");
    }
    let start = parse_date(start.as_deref().unwrap_or(DEFAULT_START), "start")?;
    let end = parse_date(end.as_deref().unwrap_or(DEFAULT_END), "end")?;
    if end <= start {
        bail!("end must be after start");
    }
    let windows = validate_windows(&windows.unwrap_or_else(|| default_windows.to_vec()), min_window)?;
    Ok(UniverseSettings {
        tickers: unique,
        start,
        end,
        windows,
        database_url,
    })
}

impl CorrelationSettings {
    pub fn from_args(args: CorrelationArgs) -> Result<Self> {
        let db = database_url(args.database_url, CORRELATION_DB_ENV, DEFAULT_CORRELATION_DB);
        Ok(Self {
            // a correlation needs at least two observations
            universe: universe(
                args.tickers,
                CORRELATION_TICKERS,
                args.start,
                args.end,
                args.windows,
                CORRELATION_WINDOWS,
                2,
                db,
            )?,
            export_dir: args.export_dir,
        })
    }
}

impl StrengthSettings {
    pub fn from_args(args: StrengthArgs) -> Result<Self> {
        let db = database_url(args.database_url, STRENGTH_DB_ENV, DEFAULT_STRENGTH_DB);
        Ok(Self {
            universe: universe(
                args.tickers,
                STRENGTH_TICKERS,
                args.start,
                args.end,
                args.windows,
                STRENGTH_WINDOWS,
                1,
                db,
            )?,
        })
    }
}

impl FetchSettings {
    pub fn from_args(args: &FetchArgs) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            concurrency: args.concurrency.unwrap_or(defaults.concurrency),
            timeout_secs: args.timeout_secs.unwrap_or(defaults.timeout_secs),
            max_retries: args.max_retries.unwrap_or(defaults.max_retries),
            retry_base_ms: args.retry_base_ms.unwrap_or(defaults.retry_base_ms),
        };
        if settings.concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        if settings.timeout_secs == 0 {
            bail!("--timeout-secs must be at least 1");
        }
        Ok(settings)
    }
}

/// Resolve the database URL of a job without building the full settings
/// (query commands only need the store).
pub fn correlation_database_url(arg: Option<String>) -> String {
    database_url(arg, CORRELATION_DB_ENV, DEFAULT_CORRELATION_DB)
}

pub fn strength_database_url(arg: Option<String>) -> String {
    database_url(arg, STRENGTH_DB_ENV, DEFAULT_STRENGTH_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_defaults() {
        let s = CorrelationSettings::from_args(CorrelationArgs {
            database_url: Some("sqlite://x.db".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.universe.tickers.len(), 22);
        assert_eq!(s.universe.windows, vec![7, 15, 30, 60, 90]);
        assert_eq!(s.universe.start, NaiveDate::from_ymd_opt(2010, 1, 1).unwrap());
        assert_eq!(s.universe.database_url, "sqlite://x.db");
        assert!(s.export_dir.is_none());
    }

    #[test]
    fn test_strength_overrides_are_normalised() {
        let s = StrengthSettings::from_args(StrengthArgs {
            tickers: Some(vec!["btc-usd".into(), "ETH-USD".into(), "BTC-USD".into()]),
            windows: Some(vec![3, 3, 7]),
            start: Some("2024-01-01".into()),
            end: Some("2024-06-01".into()),
            database_url: Some("sqlite://y.db".into()),
        })
        .unwrap();
        assert_eq!(s.universe.tickers, vec!["BTC-USD", "ETH-USD"]);
        assert_eq!(s.universe.windows, vec![3, 7]);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let bad_window = CorrelationArgs {
            windows: Some(vec![1]),
            ..Default::default()
        };
        assert!(CorrelationSettings::from_args(bad_window).is_err());

        let bad_range = StrengthArgs {
            start: Some("2024-02-01".into()),
            end: Some("2024-01-01".into()),
            ..Default::default()
        };
        assert!(StrengthSettings::from_args(bad_range).is_err());

        let bad_date = StrengthArgs {
            start: Some("01/02/2024".into()),
            ..Default::default()
        };
        assert!(StrengthSettings::from_args(bad_date).is_err());

        let no_workers = FetchArgs {
            concurrency: Some(0),
            ..Default::default()
        };
        assert!(FetchSettings::from_args(&no_workers).is_err());
    }
}
