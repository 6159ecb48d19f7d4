use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::FetchSettings;
use crate::error::{FetchError, PipelineError, Stage};
use crate::matrix::{DailyHistory, PriceMatrix, VolumeMatrix, align};
use crate::source::PriceSource;

/// Dense, aligned market data for one run.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub prices: PriceMatrix,
    pub volumes: VolumeMatrix,
    /// Requested tickers that produced no data.
    pub excluded: Vec<String>,
}

pub struct PriceMatrixLoader {
    source: Arc<dyn PriceSource>,
    settings: FetchSettings,
}

impl PriceMatrixLoader {
    pub fn new(source: Arc<dyn PriceSource>, settings: FetchSettings) -> Self {
        Self { source, settings }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> + use<> {
        // from_millis(2).factor(base/2) -> base, 2*base, 4*base, ...
        ExponentialBackoff::from_millis(2)
            .factor((self.settings.retry_base_ms / 2).max(1))
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(self.settings.max_retries)
    }

    /// Fetch one ticker, retrying transient failures.
    async fn fetch_one(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<DailyHistory>, PipelineError> {
        let attempts = AtomicUsize::new(0);
        let result = RetryIf::spawn(
            self.backoff(),
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n > 1 {
                    info!("{} retry attempt {}", ticker, n);
                }
                self.source.fetch_history(ticker, start, end)
            },
            |e: &FetchError| e.is_transient(),
        )
        .await;
        match result {
            Ok(history) => Ok(history),
            Err(FetchError::NotFound { .. }) => Ok(None),
            Err(e @ FetchError::Transient { .. }) => Err(PipelineError::UpstreamFetch {
                ticker: ticker.to_string(),
                attempts: attempts.load(Ordering::SeqCst),
                source: e,
            }),
            Err(e) => {
                // malformed payload for one ticker: exclude it like missing data
                warn!("{} excluded: {}", ticker, e);
                Ok(None)
            }
        }
    }

    /// Load close and volume for `tickers` and align them on their common
    /// dates. Tickers without data are excluded with a warning; if none is
    /// left the run fails.
    pub async fn load(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<MarketData, PipelineError> {
        if end < start {
            return Err(PipelineError::InvalidConfig(format!(
                "end {} is before start {}",
                end, start
            )));
        }
        info!(
            "loading {} tickers from {} to {}",
            tickers.len(),
            start,
            end
        );

        // `buffered` keeps results in request order
        let fetched: Vec<(String, Option<DailyHistory>)> = stream::iter(tickers.iter().cloned())
            .map(|ticker| async move {
                cancel.check(Stage::Fetch)?;
                let history = self.fetch_one(&ticker, start, end).await?;
                Ok::<_, PipelineError>((ticker, history))
            })
            .buffered(self.settings.concurrency.max(1))
            .try_collect()
            .await?;
        cancel.check(Stage::Fetch)?;

        let mut excluded = Vec::new();
        let mut histories = Vec::new();
        for (ticker, history) in fetched {
            match history {
                Some(h) if !h.valid_points().is_empty() => {
                    if let Some(last) = h.dates.last() {
                        info!("[ok] {} - last date {}", ticker, last);
                    }
                    histories.push((ticker, h));
                }
                _ => {
                    warn!("[empty] {} - no data returned, excluded", ticker);
                    excluded.push(ticker);
                }
            }
        }
        if histories.is_empty() {
            return Err(PipelineError::EmptyUniverse {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        let (prices, volumes) = align(histories).map_err(|e| PipelineError::Compute(e.to_string()))?;
        if prices.is_empty() {
            return Err(PipelineError::EmptyUniverse {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        info!(
            "aligned {} tickers on {} common dates",
            prices.width(),
            prices.len()
        );
        Ok(MarketData {
            prices,
            volumes,
            excluded,
        })
    }

    /// Market-cap snapshot per ticker. Failures degrade to `None`.
    pub async fn market_caps(&self, tickers: &[String]) -> HashMap<String, Option<f64>> {
        stream::iter(tickers.iter().cloned())
            .map(|ticker| async move {
                let cap = match self.source.fetch_market_cap(&ticker).await {
                    Ok(cap) => cap,
                    Err(e) => {
                        warn!("no market cap for {}: {}", ticker, e);
                        None
                    }
                };
                (ticker, cap)
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await
    }
}
