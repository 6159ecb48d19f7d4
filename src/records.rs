use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const CORRELATION_TABLE: &str = "rolling_correlation_long";
pub const WIDE_CORRELATION_TABLE: &str = "rolling_correlation_wide";
pub const RELATIVE_STRENGTH_TABLE: &str = "relative_strength_long";
pub const ASSET_PRICES_TABLE: &str = "asset_prices";

/// Pair label as stored: `"{first}/{second}"` in matrix column order.
pub fn pair_label(first: &str, second: &str) -> String {
    format!("{}/{}", first, second)
}

/// Split a pair label back into its two assets.
pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
    pair.split_once('/')
}

/// One row of `rolling_correlation_long`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CorrelationRecord {
    #[sqlx(rename = "Date")]
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[sqlx(rename = "Pair")]
    #[serde(rename = "Pair")]
    pub pair: String,
    #[sqlx(rename = "Window")]
    #[serde(rename = "Window")]
    pub window: u32,
    #[sqlx(rename = "RollingCorrelation")]
    #[serde(rename = "RollingCorrelation")]
    pub rolling_correlation: Option<f64>,
}

/// Column header of one pair/window series in the wide layout.
pub fn wide_header(pair: &str, window: u32) -> String {
    format!("{} ({}d)", pair, window)
}

/// Correlation rows pivoted to one row per date and one column per
/// pair/window series. Columns keep first-seen order; every row has one
/// cell per column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationPivot {
    pub columns: Vec<String>,
    pub rows: Vec<(NaiveDate, Vec<Option<f64>>)>,
}

impl CorrelationPivot {
    pub fn from_long(records: &[CorrelationRecord]) -> Self {
        let mut columns = Vec::new();
        let mut column_idx: HashMap<(&str, u32), usize> = HashMap::new();
        let mut by_date: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();
        for r in records {
            let idx = *column_idx
                .entry((r.pair.as_str(), r.window))
                .or_insert_with(|| {
                    columns.push(wide_header(&r.pair, r.window));
                    columns.len() - 1
                });
            let cells = by_date.entry(r.date).or_default();
            if cells.len() <= idx {
                cells.resize(idx + 1, None);
            }
            cells[idx] = r.rolling_correlation;
        }
        let width = columns.len();
        let rows = by_date
            .into_iter()
            .map(|(date, mut cells)| {
                cells.resize(width, None);
                (date, cells)
            })
            .collect();
        Self { columns, rows }
    }
}

/// One row of `relative_strength_long`. Only `Base/Quote` is materialized
/// for each combination; see [`RelativeStrengthRecord::invert`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RelativeStrengthRecord {
    #[sqlx(rename = "Date")]
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[sqlx(rename = "Pair")]
    #[serde(rename = "Pair")]
    pub pair: String,
    #[sqlx(rename = "Base")]
    #[serde(rename = "Base")]
    pub base: String,
    #[sqlx(rename = "Quote")]
    #[serde(rename = "Quote")]
    pub quote: String,
    #[sqlx(rename = "Window")]
    #[serde(rename = "Window")]
    pub window: u32,
    #[sqlx(rename = "RS")]
    #[serde(rename = "RS")]
    pub rs: Option<f64>,
    #[sqlx(rename = "RS_Smooth")]
    #[serde(rename = "RS_Smooth")]
    pub rs_smooth: Option<f64>,
}

impl RelativeStrengthRecord {
    /// The same observation seen as `Quote/Base`. Ratios become `1/x`; a
    /// zero ratio has no inverse and becomes null. The smoothed value is the
    /// inverse of the smoothed ratio, not the mean of inverses.
    pub fn invert(&self) -> Self {
        let inv = |v: Option<f64>| v.filter(|x| *x != 0.0 && x.is_finite()).map(|x| 1.0 / x);
        Self {
            date: self.date,
            pair: pair_label(&self.quote, &self.base),
            base: self.quote.clone(),
            quote: self.base.clone(),
            window: self.window,
            rs: inv(self.rs),
            rs_smooth: inv(self.rs_smooth),
        }
    }
}

/// One row of `asset_prices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AssetPriceRecord {
    #[sqlx(rename = "Date")]
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[sqlx(rename = "Ticker")]
    #[serde(rename = "Ticker")]
    pub ticker: String,
    #[sqlx(rename = "Price")]
    #[serde(rename = "Price")]
    pub price: f64,
    #[sqlx(rename = "Volume")]
    #[serde(rename = "Volume")]
    pub volume: f64,
    #[sqlx(rename = "RSI")]
    #[serde(rename = "RSI")]
    pub rsi: Option<f64>,
    #[sqlx(rename = "MACD")]
    #[serde(rename = "MACD")]
    pub macd: Option<f64>,
    #[sqlx(rename = "MACD_Signal")]
    #[serde(rename = "MACD_Signal")]
    pub macd_signal: Option<f64>,
    #[sqlx(rename = "SMA_20")]
    #[serde(rename = "SMA_20")]
    pub sma_20: Option<f64>,
    #[sqlx(rename = "SMA_50")]
    #[serde(rename = "SMA_50")]
    pub sma_50: Option<f64>,
    #[sqlx(rename = "EMA_20")]
    #[serde(rename = "EMA_20")]
    pub ema_20: Option<f64>,
    #[sqlx(rename = "EMA_50")]
    #[serde(rename = "EMA_50")]
    pub ema_50: Option<f64>,
    #[sqlx(rename = "MarketCap")]
    #[serde(rename = "MarketCap")]
    pub market_cap: Option<f64>,
}
