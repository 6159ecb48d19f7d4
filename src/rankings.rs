use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate};
use itertools::Itertools;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::records::{AssetPriceRecord, CorrelationRecord, RelativeStrengthRecord, split_pair};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Performance {
    pub ticker: String,
    /// `end / start - 1` over the period.
    pub period_return: f64,
    pub total_volume: f64,
    pub avg_rsi: Option<f64>,
    pub avg_macd: Option<f64>,
    pub avg_macd_signal: Option<f64>,
    pub avg_sma_20: Option<f64>,
    pub avg_sma_50: Option<f64>,
    pub avg_ema_20: Option<f64>,
    pub avg_ema_50: Option<f64>,
    pub current_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Performers {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Best returns, descending.
    pub gainers: Vec<Performance>,
    /// Worst returns, ascending.
    pub losers: Vec<Performance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairCorrelation {
    pub pair: String,
    pub correlation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationExtremes {
    pub date: NaiveDate,
    pub highest: Vec<PairCorrelation>,
    pub lowest: Vec<PairCorrelation>,
}

fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn mean_of(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let v: Vec<f64> = values.flatten().filter(|x| x.is_finite()).collect();
    if v.is_empty() { None } else { Some(v.mean()) }
}

/// Gainers and losers over the last `period_days` calendar days of `rows`.
/// Needs at least two distinct dates in the period; tickers missing on the
/// first or last date are left out.
pub fn top_performers(rows: &[AssetPriceRecord], period_days: i64, n: usize) -> Option<Performers> {
    let last = rows.iter().map(|r| r.date).max()?;
    let from = last - Duration::days(period_days.max(0));
    let period: Vec<&AssetPriceRecord> = rows
        .iter()
        .filter(|r| r.date >= from && r.date <= last)
        .collect();
    let first = period.iter().map(|r| r.date).min()?;
    if first == last {
        return None;
    }

    let by_ticker = period
        .iter()
        .copied()
        .into_group_map_by(|r| r.ticker.clone());
    let mut ranked: Vec<Performance> = by_ticker
        .into_iter()
        .filter_map(|(ticker, rs)| {
            let start = rs.iter().find(|r| r.date == first)?.price;
            let end = rs.iter().find(|r| r.date == last)?.price;
            if start == 0.0 {
                return None;
            }
            Some(Performance {
                ticker,
                period_return: end / start - 1.0,
                total_volume: rs.iter().map(|r| r.volume).sum(),
                avg_rsi: mean_of(rs.iter().map(|r| r.rsi)),
                avg_macd: mean_of(rs.iter().map(|r| r.macd)),
                avg_macd_signal: mean_of(rs.iter().map(|r| r.macd_signal)),
                avg_sma_20: mean_of(rs.iter().map(|r| r.sma_20)),
                avg_sma_50: mean_of(rs.iter().map(|r| r.sma_50)),
                avg_ema_20: mean_of(rs.iter().map(|r| r.ema_20)),
                avg_ema_50: mean_of(rs.iter().map(|r| r.ema_50)),
                current_price: end,
            })
        })
        .collect();
    ranked.sort_by(|a, b| desc(a.period_return, b.period_return).then(a.ticker.cmp(&b.ticker)));

    let gainers = ranked.iter().take(n).cloned().collect();
    let losers = ranked.iter().rev().take(n).cloned().collect();
    Some(Performers {
        start: first,
        end: last,
        gainers,
        losers,
    })
}

/// Highest and lowest correlations on the latest date that has any value.
pub fn top_correlations(rows: &[CorrelationRecord], n: usize) -> Option<CorrelationExtremes> {
    let date = rows
        .iter()
        .filter(|r| r.rolling_correlation.is_some())
        .map(|r| r.date)
        .max()?;
    let mut latest: Vec<PairCorrelation> = rows
        .iter()
        .filter(|r| r.date == date)
        .filter_map(|r| {
            r.rolling_correlation.map(|c| PairCorrelation {
                pair: r.pair.clone(),
                correlation: c,
            })
        })
        .collect();
    latest.sort_by(|a, b| desc(a.correlation, b.correlation).then(a.pair.cmp(&b.pair)));
    Some(CorrelationExtremes {
        date,
        highest: latest.iter().take(n).cloned().collect(),
        lowest: latest.iter().rev().take(n).cloned().collect(),
    })
}

/// Mean of the non-null correlations of every pair, highest first.
pub fn mean_correlation_by_pair(rows: &[CorrelationRecord]) -> Vec<PairCorrelation> {
    let mut grouped: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for r in rows {
        if let Some(c) = r.rolling_correlation {
            grouped.entry(r.pair.as_str()).or_default().push(c);
        }
    }
    let mut out: Vec<PairCorrelation> = grouped
        .into_iter()
        .map(|(pair, values)| PairCorrelation {
            pair: pair.to_string(),
            correlation: values.mean(),
        })
        .collect();
    out.sort_by(|a, b| desc(a.correlation, b.correlation));
    out
}

/// Rows of `window` on its latest date, strongest ratio first. Null ratios
/// sort last.
pub fn relative_strength_ranking(
    rows: &[RelativeStrengthRecord],
    window: u32,
) -> Vec<RelativeStrengthRecord> {
    let Some(date) = rows
        .iter()
        .filter(|r| r.window == window)
        .map(|r| r.date)
        .max()
    else {
        return Vec::new();
    };
    let mut latest: Vec<RelativeStrengthRecord> = rows
        .iter()
        .filter(|r| r.window == window && r.date == date)
        .cloned()
        .collect();
    latest.sort_by(|a, b| match (a.rs, b.rs) {
        (Some(x), Some(y)) => desc(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    latest
}

/// Sorted unique asset names appearing in pair labels.
pub fn assets_in_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    pairs
        .into_iter()
        .filter_map(split_pair)
        .flat_map(|(a, b)| [a, b])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, day).unwrap()
    }

    fn price(day: u32, ticker: &str, p: f64, rsi: Option<f64>) -> AssetPriceRecord {
        AssetPriceRecord {
            date: d(day),
            ticker: ticker.into(),
            price: p,
            volume: 10.0,
            rsi,
            macd: Some(1.0),
            macd_signal: Some(0.5),
            sma_20: None,
            sma_50: None,
            ema_20: Some(p),
            ema_50: Some(p),
            market_cap: None,
        }
    }

    fn corr(day: u32, pair: &str, v: Option<f64>) -> CorrelationRecord {
        CorrelationRecord {
            date: d(day),
            pair: pair.into(),
            window: 7,
            rolling_correlation: v,
        }
    }

    #[test]
    fn test_top_performers() {
        let rows = vec![
            price(1, "A", 100.0, Some(40.0)),
            price(5, "A", 150.0, None),
            price(1, "B", 100.0, Some(60.0)),
            price(5, "B", 80.0, Some(70.0)),
            price(1, "C", 10.0, None),
            price(5, "C", 11.0, None),
        ];
        let p = top_performers(&rows, 30, 2).unwrap();
        assert_eq!((p.start, p.end), (d(1), d(5)));
        let gainers: Vec<&str> = p.gainers.iter().map(|g| g.ticker.as_str()).collect();
        let losers: Vec<&str> = p.losers.iter().map(|g| g.ticker.as_str()).collect();
        assert_eq!(gainers, vec!["A", "C"]);
        assert_eq!(losers, vec!["B", "C"]);
        assert!((p.gainers[0].period_return - 0.5).abs() < 1e-12);
        assert_eq!(p.gainers[0].avg_rsi, Some(40.0));
        assert_eq!(p.losers[0].avg_rsi, Some(65.0));
        assert_eq!(p.gainers[1].avg_rsi, None);
        assert_eq!(p.gainers[0].total_volume, 20.0);
        assert_eq!(p.gainers[0].current_price, 150.0);
    }

    #[test]
    fn test_top_performers_needs_two_dates() {
        let rows = vec![price(1, "A", 1.0, None), price(9, "A", 2.0, None)];
        assert!(top_performers(&rows, 3, 5).is_none());
        assert!(top_performers(&[], 30, 5).is_none());
    }

    #[test]
    fn test_top_correlations_use_latest_non_null_date() {
        let rows = vec![
            corr(1, "A/B", Some(0.9)),
            corr(2, "A/B", Some(0.3)),
            corr(2, "A/C", Some(-0.7)),
            corr(2, "B/C", None),
            corr(3, "A/B", None),
        ];
        let t = top_correlations(&rows, 1).unwrap();
        assert_eq!(t.date, d(2));
        assert_eq!(t.highest[0].pair, "A/B");
        assert_eq!(t.lowest[0].pair, "A/C");
        assert!(top_correlations(&[corr(1, "A/B", None)], 3).is_none());
    }

    #[test]
    fn test_mean_correlation_by_pair_skips_nulls() {
        let rows = vec![
            corr(1, "A/B", Some(0.2)),
            corr(2, "A/B", Some(0.4)),
            corr(1, "A/C", None),
            corr(2, "A/C", Some(0.9)),
        ];
        let m = mean_correlation_by_pair(&rows);
        assert_eq!(m[0].pair, "A/C");
        assert!((m[0].correlation - 0.9).abs() < 1e-12);
        assert!((m[1].correlation - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_relative_strength_ranking() {
        let rs = |day, pair: &str, window, v: Option<f64>| {
            let (base, quote) = split_pair(pair).unwrap();
            RelativeStrengthRecord {
                date: d(day),
                pair: pair.into(),
                base: base.into(),
                quote: quote.into(),
                window,
                rs: v,
                rs_smooth: None,
            }
        };
        let rows = vec![
            rs(1, "A/B", 3, Some(9.0)),
            rs(2, "A/B", 3, Some(2.0)),
            rs(2, "A/C", 3, None),
            rs(2, "B/C", 3, Some(5.0)),
            rs(3, "A/B", 7, Some(1.0)),
        ];
        let ranked = relative_strength_ranking(&rows, 3);
        let pairs: Vec<&str> = ranked.iter().map(|r| r.pair.as_str()).collect();
        assert_eq!(pairs, vec!["B/C", "A/B", "A/C"]);
        assert!(relative_strength_ranking(&rows, 30).is_empty());
    }

    #[test]
    fn test_assets_in_pairs() {
        let assets = assets_in_pairs(["ETH-USD/BTC-USD", "BTC-USD/SOL-USD", "broken"]);
        assert_eq!(assets, vec!["BTC-USD", "ETH-USD", "SOL-USD"]);
    }
}
