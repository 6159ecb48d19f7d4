use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fs2::FileExt;
use tracing::{error, info, warn};

use crate::cache::ReadCache;
use crate::cancel::CancelToken;
use crate::config::{CorrelationSettings, StrengthSettings};
use crate::error::{PipelineError, Stage};
use crate::export::write_correlation_exports;
use crate::indicators::build_asset_prices;
use crate::loader::PriceMatrixLoader;
use crate::records::{
    ASSET_PRICES_TABLE, CORRELATION_TABLE, CorrelationPivot, RELATIVE_STRENGTH_TABLE,
    WIDE_CORRELATION_TABLE,
};
use crate::store::ResultStore;
use crate::{correlation, relative_strength};

/// Exclusive advisory lock held for the lifetime of the returned file.
pub fn acquire_lock(lock_path: &Path) -> Result<File> {
    fs::create_dir_all(lock_path.parent().unwrap_or(Path::new("."))).ok();
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)?;
    file.lock_exclusive()?;
    Ok(file)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Correlation,
    RelativeStrength,
}

impl JobKind {
    pub fn tables(self) -> &'static [&'static str] {
        match self {
            JobKind::Correlation => &[CORRELATION_TABLE, WIDE_CORRELATION_TABLE],
            JobKind::RelativeStrength => &[RELATIVE_STRENGTH_TABLE, ASSET_PRICES_TABLE],
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Correlation => "correlation",
            JobKind::RelativeStrength => "relative-strength",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job: JobKind,
    /// `(table, rows)` as committed.
    pub tables: Vec<(&'static str, usize)>,
    pub tickers: usize,
    pub dates: usize,
    pub excluded: Vec<String>,
    pub exported: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct JobFailure {
    pub job: JobKind,
    pub stage: Stage,
    pub error: PipelineError,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} job failed during {}: {}", self.job, self.stage, self.error)
    }
}

impl std::error::Error for JobFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type JobOutcome = Result<JobReport, JobFailure>;

#[derive(Debug)]
pub struct PipelineReport {
    pub outcomes: Vec<JobOutcome>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobFailure> {
        self.outcomes.iter().filter_map(|o| o.as_ref().err())
    }
}

/// One independently persisted unit of work.
#[async_trait]
pub trait Job: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Load, compute and replace this job's tables. On error nothing of this
    /// job is visible in the store.
    async fn run(&self, cancel: &CancelToken) -> Result<JobReport, PipelineError>;
}

fn worker_failed(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Compute(format!("worker task failed: {}", e))
}

/// Rolling correlation of every pair in the correlation universe.
pub struct CorrelationJob {
    settings: CorrelationSettings,
    loader: Arc<PriceMatrixLoader>,
    store: ResultStore,
}

impl CorrelationJob {
    pub fn new(
        settings: CorrelationSettings,
        loader: Arc<PriceMatrixLoader>,
        store: ResultStore,
    ) -> Self {
        Self {
            settings,
            loader,
            store,
        }
    }
}

#[async_trait]
impl Job for CorrelationJob {
    fn kind(&self) -> JobKind {
        JobKind::Correlation
    }

    async fn run(&self, cancel: &CancelToken) -> Result<JobReport, PipelineError> {
        let u = &self.settings.universe;
        let data = self.loader.load(&u.tickers, u.start, u.end, cancel).await?;
        let (tickers, dates) = (data.prices.width(), data.prices.len());

        let prices = Arc::new(data.prices);
        let windows = u.windows.clone();
        let token = cancel.clone();
        let (rows, wide) = tokio::task::spawn_blocking(move || {
            let rows = correlation::compute_all(&prices, &windows, &token)?;
            let wide = CorrelationPivot::from_long(&rows);
            Ok::<_, PipelineError>((rows, wide))
        })
        .await
        .map_err(worker_failed)??;
        if rows.is_empty() {
            return Err(PipelineError::EmptyResult {
                table: CORRELATION_TABLE,
            });
        }

        cancel.check(Stage::Persist)?;
        let mut replacement = self.store.begin_replace().await?;
        replacement.stage(&rows).await?;
        replacement.stage_wide(WIDE_CORRELATION_TABLE, &wide).await?;
        cancel.check(Stage::Persist)?;
        let tables = replacement.commit().await?;

        let exported = match &self.settings.export_dir {
            Some(dir) => write_correlation_exports(dir, &rows).map_err(|e| {
                PipelineError::Export {
                    path: dir.display().to_string(),
                    reason: format!("{:#}", e),
                }
            })?,
            None => Vec::new(),
        };

        Ok(JobReport {
            job: self.kind(),
            tables,
            tickers,
            dates,
            excluded: data.excluded,
            exported,
        })
    }
}

/// Relative strength of every combination plus per-asset indicators.
pub struct StrengthJob {
    settings: StrengthSettings,
    loader: Arc<PriceMatrixLoader>,
    store: ResultStore,
}

impl StrengthJob {
    pub fn new(
        settings: StrengthSettings,
        loader: Arc<PriceMatrixLoader>,
        store: ResultStore,
    ) -> Self {
        Self {
            settings,
            loader,
            store,
        }
    }
}

#[async_trait]
impl Job for StrengthJob {
    fn kind(&self) -> JobKind {
        JobKind::RelativeStrength
    }

    async fn run(&self, cancel: &CancelToken) -> Result<JobReport, PipelineError> {
        let u = &self.settings.universe;
        let data = self.loader.load(&u.tickers, u.start, u.end, cancel).await?;
        let (tickers, dates) = (data.prices.width(), data.prices.len());
        let caps = self.loader.market_caps(data.prices.tickers()).await;
        cancel.check(Stage::Compute)?;

        let prices = Arc::new(data.prices);
        let volumes = Arc::new(data.volumes);
        let windows = u.windows.clone();
        let token = cancel.clone();
        let (strength, asset_prices) = tokio::task::spawn_blocking(move || {
            let strength = relative_strength::compute_all(&prices, &windows, &token)?;
            token.check(Stage::Compute)?;
            let asset_prices = build_asset_prices(&prices, &volumes, &caps);
            Ok::<_, PipelineError>((strength, asset_prices))
        })
        .await
        .map_err(worker_failed)??;
        if strength.is_empty() {
            return Err(PipelineError::EmptyResult {
                table: RELATIVE_STRENGTH_TABLE,
            });
        }
        if asset_prices.is_empty() {
            return Err(PipelineError::EmptyResult {
                table: ASSET_PRICES_TABLE,
            });
        }

        cancel.check(Stage::Persist)?;
        let mut replacement = self.store.begin_replace().await?;
        replacement.stage(&strength).await?;
        replacement.stage(&asset_prices).await?;
        cancel.check(Stage::Persist)?;
        let tables = replacement.commit().await?;

        Ok(JobReport {
            job: self.kind(),
            tables,
            tickers,
            dates,
            excluded: data.excluded,
            exported: Vec::new(),
        })
    }
}

/// Runs jobs, turns their errors into `JobFailure`s and keeps an optional
/// read cache in sync with what was committed.
#[derive(Default)]
pub struct Pipeline {
    cache: Option<Arc<ReadCache>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: Arc<ReadCache>) -> Self {
        Self { cache: Some(cache) }
    }

    pub async fn run_job(&self, job: &dyn Job, cancel: &CancelToken) -> JobOutcome {
        let kind = job.kind();
        info!("{} job started", kind);
        match job.run(cancel).await {
            Ok(report) => {
                if let Some(cache) = &self.cache {
                    cache.invalidate(kind.tables()).await;
                }
                if !report.excluded.is_empty() {
                    warn!("{} job excluded {:?}", kind, report.excluded);
                }
                info!(
                    "{} job done: {} tickers x {} dates, {:?}",
                    kind, report.tickers, report.dates, report.tables
                );
                Ok(report)
            }
            Err(e) => {
                let failure = JobFailure {
                    job: kind,
                    stage: e.stage(),
                    error: e,
                };
                error!("{}", failure);
                Err(failure)
            }
        }
    }

    /// Both jobs concurrently. A failure in one does not stop the other.
    pub async fn run_all(
        &self,
        correlation: &CorrelationJob,
        strength: &StrengthJob,
        cancel: &CancelToken,
    ) -> PipelineReport {
        let (c, s) = tokio::join!(
            self.run_job(correlation, cancel),
            self.run_job(strength, cancel)
        );
        PipelineReport {
            outcomes: vec![c, s],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("run.lock");
        let _held = acquire_lock(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_job_tables() {
        assert_eq!(
            JobKind::Correlation.tables(),
            &[CORRELATION_TABLE, WIDE_CORRELATION_TABLE]
        );
        assert_eq!(
            JobKind::RelativeStrength.tables(),
            &[RELATIVE_STRENGTH_TABLE, ASSET_PRICES_TABLE]
        );
        assert_eq!(JobKind::RelativeStrength.to_string(), "relative-strength");
    }

    #[test]
    fn test_failure_message_names_job_and_stage() {
        let failure = JobFailure {
            job: JobKind::Correlation,
            stage: Stage::Persist,
            error: PipelineError::Cancelled {
                stage: Stage::Persist,
            },
        };
        assert_eq!(
            failure.to_string(),
            "correlation job failed during persist: cancelled during persist"
        );
    }
}
