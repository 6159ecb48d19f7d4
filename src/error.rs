use std::fmt;

use thiserror::Error;

/// Where in a job a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Compute,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Compute => "compute",
            Stage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Errors raised by a `PriceSource`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no data for {ticker}")]
    NotFound { ticker: String },

    #[error("transient failure for {ticker}: {reason}")]
    Transient { ticker: String, reason: String },

    #[error("malformed payload for {ticker}: {reason}")]
    Malformed { ticker: String, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store at {url}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to replace table {table}")]
    Replace {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to read table {table}")]
    Read {
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Fatal errors of a batch job. Recoverable conditions (a ticker without
/// data, a window without enough history) never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no ticker returned data between {start} and {end}")]
    EmptyUniverse { start: String, end: String },

    #[error("upstream fetch failed for {ticker} after {attempts} attempts: {source}")]
    UpstreamFetch {
        ticker: String,
        attempts: usize,
        #[source]
        source: FetchError,
    },

    #[error("{table} would be written with zero rows")]
    EmptyResult { table: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("export to {path} failed: {reason}")]
    Export { path: String, reason: String },

    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("computation failed: {0}")]
    Compute(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::EmptyUniverse { .. }
            | PipelineError::UpstreamFetch { .. }
            | PipelineError::InvalidConfig(_) => Stage::Fetch,
            PipelineError::EmptyResult { .. } | PipelineError::Compute(_) => Stage::Compute,
            PipelineError::Store(_) | PipelineError::Export { .. } => Stage::Persist,
            PipelineError::Cancelled { stage } => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retried() {
        let t = FetchError::Transient {
            ticker: "BTC-USD".into(),
            reason: "HTTP 503".into(),
        };
        let n = FetchError::NotFound {
            ticker: "XYZ-USD".into(),
        };
        assert!(t.is_transient());
        assert!(!n.is_transient());
    }

    #[test]
    fn test_stage_mapping() {
        let e = PipelineError::EmptyUniverse {
            start: "2024-01-01".into(),
            end: "2024-02-01".into(),
        };
        assert_eq!(e.stage(), Stage::Fetch);
        assert_eq!(
            PipelineError::EmptyResult {
                table: "asset_prices"
            }
            .stage(),
            Stage::Compute
        );
        assert_eq!(
            PipelineError::Cancelled {
                stage: Stage::Persist
            }
            .stage(),
            Stage::Persist
        );
        assert_eq!(Stage::Compute.to_string(), "compute");
    }
}
