use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use chrono::NaiveDate;

/// Dense date x ticker table. Every column has a value on every date.
///
/// Column order is significant: pair labels downstream are derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    dates: Vec<NaiveDate>,
    tickers: Vec<String>,
    columns: Vec<Vec<f64>>,
}

/// Adjusted close prices.
pub type PriceMatrix = Matrix;
/// Traded volume, same index and columns as the matching `PriceMatrix`.
pub type VolumeMatrix = Matrix;

impl Matrix {
    pub fn new(dates: Vec<NaiveDate>, columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        if dates.windows(2).any(|w| w[0] >= w[1]) {
            bail!("dates must be strictly increasing");
        }
        let mut seen = BTreeSet::new();
        let mut tickers = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len());
        for (ticker, col) in columns {
            if col.len() != dates.len() {
                bail!(
                    "column {} has {} values for {} dates",
                    ticker,
                    col.len(),
                    dates.len()
                );
            }
            if !seen.insert(ticker.clone()) {
                bail!("duplicate column {}", ticker);
            }
            tickers.push(ticker);
            values.push(col);
        }
        Ok(Self {
            dates,
            tickers,
            columns: values,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.tickers.is_empty()
    }

    pub fn width(&self) -> usize {
        self.tickers.len()
    }

    pub fn column_at(&self, idx: usize) -> &[f64] {
        &self.columns[idx]
    }

    pub fn column(&self, ticker: &str) -> Option<&[f64]> {
        self.tickers
            .iter()
            .position(|t| t == ticker)
            .map(|i| self.columns[i].as_slice())
    }

    /// Sub-matrix with the given columns, in the given order.
    pub fn select(&self, tickers: &[&str]) -> Result<Self> {
        let mut cols = Vec::with_capacity(tickers.len());
        for t in tickers {
            match self.column(t) {
                Some(c) => cols.push((t.to_string(), c.to_vec())),
                None => bail!("unknown column {}", t),
            }
        }
        Self::new(self.dates.clone(), cols)
    }
}

/// One ticker's raw daily history as returned by a source. Values may be
/// missing or non-finite on some dates.
#[derive(Debug, Clone, Default)]
pub struct DailyHistory {
    pub dates: Vec<NaiveDate>,
    pub close: Vec<Option<f64>>,
    pub volume: Vec<Option<f64>>,
}

impl DailyHistory {
    /// Dates with a usable close. Volume is filtered on its own: a missing
    /// or non-finite volume reads as 0 and keeps the date.
    pub fn valid_points(&self) -> BTreeMap<NaiveDate, (f64, f64)> {
        self.dates
            .iter()
            .zip(self.close.iter().zip(self.volume.iter()))
            .filter_map(|(d, (c, v))| {
                let c = c.filter(|c| c.is_finite())?;
                let v = v.filter(|v| v.is_finite()).unwrap_or(0.0);
                Some((*d, (c, v)))
            })
            .collect()
    }
}

/// Common date index across all series (inner join).
pub fn intersect_dates<'a, I>(series: I) -> Vec<NaiveDate>
where
    I: IntoIterator<Item = &'a BTreeMap<NaiveDate, (f64, f64)>>,
{
    let mut iter = series.into_iter();
    let mut base: BTreeSet<NaiveDate> = match iter.next() {
        Some(first) => first.keys().cloned().collect(),
        None => return vec![],
    };
    for s in iter {
        base.retain(|d| s.contains_key(d));
    }
    base.into_iter().collect()
}

/// Align per-ticker histories into dense price and volume matrices.
/// Tickers keep the order they are given in.
pub fn align(histories: Vec<(String, DailyHistory)>) -> Result<(PriceMatrix, VolumeMatrix)> {
    let points: Vec<(String, BTreeMap<NaiveDate, (f64, f64)>)> = histories
        .into_iter()
        .map(|(t, h)| (t, h.valid_points()))
        .filter(|(_, p)| !p.is_empty())
        .collect();
    let dates = intersect_dates(points.iter().map(|(_, p)| p));

    let mut prices = Vec::with_capacity(points.len());
    let mut volumes = Vec::with_capacity(points.len());
    for (ticker, p) in &points {
        let (close, vol): (Vec<f64>, Vec<f64>) = dates.iter().map(|d| p[d]).unzip();
        prices.push((ticker.clone(), close));
        volumes.push((ticker.clone(), vol));
    }
    Ok((
        Matrix::new(dates.clone(), prices)?,
        Matrix::new(dates, volumes)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn history(days: &[u32], close: &[Option<f64>]) -> DailyHistory {
        DailyHistory {
            dates: days.iter().map(|x| d(*x)).collect(),
            close: close.to_vec(),
            volume: vec![Some(10.0); days.len()],
        }
    }

    #[test]
    fn test_align_drops_dates_missing_in_any_ticker() {
        let btc = history(&[1, 2, 3, 4], &[Some(1.0), Some(2.0), None, Some(4.0)]);
        let eth = history(&[2, 3, 4, 5], &[Some(20.0), Some(30.0), Some(40.0), Some(50.0)]);
        let (prices, volumes) =
            align(vec![("BTC-USD".into(), btc), ("ETH-USD".into(), eth)]).unwrap();

        assert_eq!(prices.dates(), &[d(2), d(4)]);
        assert_eq!(prices.tickers(), &["BTC-USD", "ETH-USD"]);
        assert_eq!(prices.column("BTC-USD").unwrap(), &[2.0, 4.0]);
        assert_eq!(prices.column("ETH-USD").unwrap(), &[20.0, 40.0]);
        assert_eq!(volumes.dates(), prices.dates());
        assert_eq!(volumes.tickers(), prices.tickers());
    }

    #[test]
    fn test_align_skips_empty_histories() {
        let btc = history(&[1, 2], &[Some(1.0), Some(2.0)]);
        let dead = history(&[1, 2], &[None, Some(f64::NAN)]);
        let (prices, _) = align(vec![("BTC-USD".into(), btc), ("DEAD-USD".into(), dead)]).unwrap();
        assert_eq!(prices.tickers(), &["BTC-USD"]);
        assert_eq!(prices.len(), 2);
    }

    #[test]
    fn test_missing_volume_keeps_the_price_date() {
        let mut btc = history(&[1, 2, 3], &[Some(1.0), Some(2.0), Some(3.0)]);
        btc.volume = vec![Some(5.0), None, Some(f64::INFINITY)];
        let eth = history(&[1, 2, 3], &[Some(10.0), Some(20.0), Some(30.0)]);
        let (prices, volumes) =
            align(vec![("BTC-USD".into(), btc), ("ETH-USD".into(), eth)]).unwrap();

        assert_eq!(prices.dates(), &[d(1), d(2), d(3)]);
        assert_eq!(prices.column("BTC-USD").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(volumes.column("BTC-USD").unwrap(), &[5.0, 0.0, 0.0]);
        assert_eq!(volumes.column("ETH-USD").unwrap(), &[10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_matrix_rejects_ragged_columns() {
        let res = Matrix::new(vec![d(1), d(2)], vec![("A".into(), vec![1.0])]);
        assert!(res.is_err());
        let res = Matrix::new(vec![d(2), d(1)], vec![("A".into(), vec![1.0, 2.0])]);
        assert!(res.is_err());
    }

    #[test]
    fn test_select_keeps_requested_order() {
        let m = Matrix::new(
            vec![d(1)],
            vec![
                ("A".into(), vec![1.0]),
                ("B".into(), vec![2.0]),
                ("C".into(), vec![3.0]),
            ],
        )
        .unwrap();
        let s = m.select(&["C", "A"]).unwrap();
        assert_eq!(s.tickers(), &["C", "A"]);
        assert_eq!(s.column_at(0), &[3.0]);
        assert!(m.select(&["Z"]).is_err());
    }
}
