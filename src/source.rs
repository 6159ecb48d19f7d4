use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use csv::ReaderBuilder;
use itertools::Itertools;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::FetchError;
use crate::matrix::DailyHistory;

/// Historical-data provider boundary.
///
/// `Ok(None)` means the provider knows nothing about the ticker in range;
/// the loader drops such tickers instead of failing.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<DailyHistory>, FetchError>;

    /// Current market capitalization snapshot.
    async fn fetch_market_cap(&self, ticker: &str) -> Result<Option<f64>, FetchError>;
}

const CHART_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";
const QUOTE_URL: &str = "https://query2.finance.yahoo.com/v7/finance/quote";

/// Daily bars from the Yahoo Finance chart endpoint.
pub struct YahooSource {
    client: Client,
}

impl YahooSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: mk_client(timeout)?,
        })
    }
}

/// HTTP client with compression and a bounded per-request timeout.
pub fn mk_client(timeout: Duration) -> anyhow::Result<Client> {
    let client = Client::builder()
        .user_agent("crypto_analytics/0.1 (rust)")
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<QuoteBlock>,
    #[serde(default)]
    adjclose: Vec<AdjCloseBlock>,
}

#[derive(Debug, Deserialize)]
struct QuoteBlock {
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseBlock {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct QuoteEnvelope {
    #[serde(rename = "quoteResponse")]
    quote_response: QuoteResponse,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(default)]
    result: Vec<QuoteSnapshot>,
}

#[derive(Debug, Deserialize)]
struct QuoteSnapshot {
    #[serde(rename = "marketCap")]
    market_cap: Option<f64>,
}

/// GET and decode JSON, classifying failures for the retry policy.
async fn get_json<T: for<'de> Deserialize<'de>>(
    client: &Client,
    url: reqwest::Url,
    ticker: &str,
) -> Result<T, FetchError> {
    let transient = |reason: String| FetchError::Transient {
        ticker: ticker.to_string(),
        reason,
    };
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| transient(e.to_string()))?;
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound {
            ticker: ticker.to_string(),
        });
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(transient(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(FetchError::Malformed {
            ticker: ticker.to_string(),
            reason: format!("HTTP {}: {}", status, body),
        });
    }
    resp.json::<T>().await.map_err(|e| FetchError::Malformed {
        ticker: ticker.to_string(),
        reason: e.to_string(),
    })
}

/// Collapse raw (timestamp, close, volume) points to one per UTC date,
/// keeping the last point of each date.
fn daily_from_points(mut points: Vec<(i64, Option<f64>, Option<f64>)>) -> DailyHistory {
    points.sort_by_key(|p| p.0);
    let mut out = DailyHistory::default();
    for (date, group) in &points.into_iter().chunk_by(|p| {
        Utc.timestamp_opt(p.0, 0)
            .single()
            .map(|t| t.date_naive())
    }) {
        let (Some(date), Some(last)) = (date, group.last()) else {
            continue;
        };
        out.dates.push(date);
        out.close.push(last.1);
        out.volume.push(last.2);
    }
    out
}

fn parse_chart(body: ChartEnvelope) -> Option<DailyHistory> {
    let result = body.chart.result?.into_iter().next()?;
    let quote = result.indicators.quote.into_iter().next()?;
    // prefer adjusted close when the endpoint provides it
    let close = match result.indicators.adjclose.into_iter().next() {
        Some(adj) if adj.adjclose.len() == result.timestamp.len() => adj.adjclose,
        _ => quote.close,
    };
    let points: Vec<_> = result
        .timestamp
        .iter()
        .enumerate()
        .map(|(i, ts)| {
            (
                *ts,
                close.get(i).copied().flatten(),
                quote.volume.get(i).copied().flatten(),
            )
        })
        .collect();
    let history = daily_from_points(points);
    (!history.dates.is_empty()).then_some(history)
}

#[async_trait]
impl PriceSource for YahooSource {
    async fn fetch_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<DailyHistory>, FetchError> {
        let to_ts = |d: NaiveDate, h, m, s| {
            d.and_hms_opt(h, m, s)
                .map(|dt| Utc.from_utc_datetime(&dt).timestamp())
                .unwrap_or_default()
        };
        let url = reqwest::Url::parse_with_params(
            &format!("{}/{}", CHART_URL, ticker),
            &[
                ("period1", to_ts(start, 0, 0, 0).to_string()),
                ("period2", to_ts(end, 23, 59, 59).to_string()),
                ("interval", "1d".to_string()),
                ("events", "history".to_string()),
                ("includeAdjustedClose", "true".to_string()),
            ],
        )
        .map_err(|e| FetchError::Malformed {
            ticker: ticker.to_string(),
            reason: e.to_string(),
        })?;
        debug!("GET {}", url);
        match get_json::<ChartEnvelope>(&self.client, url, ticker).await {
            Ok(body) => Ok(parse_chart(body)),
            Err(FetchError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_market_cap(&self, ticker: &str) -> Result<Option<f64>, FetchError> {
        let url = reqwest::Url::parse_with_params(QUOTE_URL, &[("symbols", ticker)]).map_err(
            |e| FetchError::Malformed {
                ticker: ticker.to_string(),
                reason: e.to_string(),
            },
        )?;
        let body = get_json::<QuoteEnvelope>(&self.client, url, ticker).await?;
        Ok(body
            .quote_response
            .result
            .into_iter()
            .next()
            .and_then(|q| q.market_cap))
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    date: NaiveDate,
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

/// Offline source: one `{TICKER}.csv` per ticker with `date,close[,volume]`.
/// An optional `market_caps.csv` (`ticker,market_cap`) supplies snapshots.
pub struct CsvSource {
    dir: PathBuf,
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_series(path: &Path, ticker: &str) -> Result<DailyHistory, FetchError> {
        let malformed = |e: csv::Error| FetchError::Malformed {
            ticker: ticker.to_string(),
            reason: e.to_string(),
        };
        let mut rdr = ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(malformed)?;
        let mut out = DailyHistory::default();
        for rec in rdr.deserialize::<CsvRow>() {
            let r = rec.map_err(malformed)?;
            out.dates.push(r.date);
            out.close.push(r.close);
            // volume column is optional for price-only exports
            out.volume.push(Some(r.volume.unwrap_or(0.0)));
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct MarketCapRow {
    ticker: String,
    market_cap: Option<f64>,
}

#[async_trait]
impl PriceSource for CsvSource {
    async fn fetch_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<DailyHistory>, FetchError> {
        let path = self.dir.join(format!("{}.csv", ticker));
        if !path.exists() {
            return Ok(None);
        }
        let full = Self::read_series(&path, ticker)?;
        let mut out = DailyHistory::default();
        for i in 0..full.dates.len() {
            if full.dates[i] >= start && full.dates[i] <= end {
                out.dates.push(full.dates[i]);
                out.close.push(full.close[i]);
                out.volume.push(full.volume[i]);
            }
        }
        Ok((!out.dates.is_empty()).then_some(out))
    }

    async fn fetch_market_cap(&self, ticker: &str) -> Result<Option<f64>, FetchError> {
        let path = self.dir.join("market_caps.csv");
        if !path.exists() {
            return Ok(None);
        }
        let mut rdr = ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| FetchError::Malformed {
                ticker: ticker.to_string(),
                reason: e.to_string(),
            })?;
        for rec in rdr.deserialize::<MarketCapRow>() {
            let row = rec.map_err(|e| FetchError::Malformed {
                ticker: ticker.to_string(),
                reason: e.to_string(),
            })?;
            if row.ticker == ticker {
                return Ok(row.market_cap);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_chart_prefers_adjusted_close() {
        let body: ChartEnvelope = serde_json::from_value(serde_json::json!({
            "chart": {
                "result": [{
                    "timestamp": [1704067200, 1704153600, 1704240000],
                    "indicators": {
                        "quote": [{
                            "close": [10.0, null, 12.0],
                            "volume": [100, 200, 300]
                        }],
                        "adjclose": [{ "adjclose": [9.5, 10.5, 11.5] }]
                    }
                }],
                "error": null
            }
        }))
        .unwrap();
        let h = parse_chart(body).unwrap();
        assert_eq!(h.dates[0], NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(h.close, vec![Some(9.5), Some(10.5), Some(11.5)]);
        assert_eq!(h.volume, vec![Some(100.0), Some(200.0), Some(300.0)]);
    }

    #[test]
    fn test_parse_chart_without_result_is_none() {
        let body: ChartEnvelope = serde_json::from_value(serde_json::json!({
            "chart": { "result": null, "error": { "code": "Not Found" } }
        }))
        .unwrap();
        assert!(parse_chart(body).is_none());
    }

    #[test]
    fn test_daily_points_keep_last_per_date() {
        let h = daily_from_points(vec![
            (1704067200 + 3600, Some(2.0), Some(1.0)),
            (1704067200, Some(1.0), Some(1.0)),
            (1704153600, Some(3.0), None),
        ]);
        assert_eq!(h.dates.len(), 2);
        assert_eq!(h.close, vec![Some(2.0), Some(3.0)]);
        assert_eq!(h.volume, vec![Some(1.0), None]);
    }

    #[tokio::test]
    async fn test_csv_source_filters_range_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("BTC-USD.csv"),
            "date,close,volume\n2024-01-01,100,5\n2024-01-02,101,6\n2024-01-03,,7\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("market_caps.csv"),
            "ticker,market_cap\nBTC-USD,1000000\n",
        )
        .unwrap();
        let src = CsvSource::new(dir.path());
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();

        let h = src.fetch_history("BTC-USD", start, end).await.unwrap().unwrap();
        assert_eq!(h.dates.len(), 2);
        assert_eq!(h.close, vec![Some(101.0), None]);
        assert!(src.fetch_history("XYZ-USD", start, end).await.unwrap().is_none());
        assert_eq!(src.fetch_market_cap("BTC-USD").await.unwrap(), Some(1_000_000.0));
        assert_eq!(src.fetch_market_cap("ETH-USD").await.unwrap(), None);
    }
}
