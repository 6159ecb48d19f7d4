use itertools::Itertools;
use rayon::prelude::*;
use std::collections::HashMap;

use crate::matrix::{PriceMatrix, VolumeMatrix};
use crate::records::AssetPriceRecord;

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

/// Trailing arithmetic mean; `None` until `w` samples exist.
pub fn rolling_ma(x: &[f64], w: usize) -> Vec<Option<f64>> {
    if w == 0 {
        return vec![None; x.len()];
    }
    let mut out = vec![None; x.len()];
    let mut sum = 0.0;
    for i in 0..x.len() {
        sum += x[i];
        if i >= w {
            sum -= x[i - w];
        }
        if i + 1 >= w {
            out[i] = Some(sum / w as f64);
        }
    }
    out
}

/// Trailing mean over a series with holes. A window containing a hole is
/// `None`.
pub fn rolling_ma_opt(x: &[Option<f64>], w: usize) -> Vec<Option<f64>> {
    if w == 0 {
        return vec![None; x.len()];
    }
    let mut out = vec![None; x.len()];
    let mut sum = 0.0;
    let mut holes = 0usize;
    for i in 0..x.len() {
        match x[i] {
            Some(v) => sum += v,
            None => holes += 1,
        }
        if i >= w {
            match x[i - w] {
                Some(v) => sum -= v,
                None => holes -= 1,
            }
        }
        if i + 1 >= w && holes == 0 {
            out[i] = Some(sum / w as f64);
        }
    }
    out
}

/// Recursive EMA seeded with the first sample:
/// `ema[0] = x[0]`, `ema[t] = x[t]*k + ema[t-1]*(1-k)`, `k = 2/(span+1)`.
pub fn ema(x: &[f64], span: usize) -> Vec<f64> {
    let k = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(x.len());
    let mut prev: Option<f64> = None;
    for &v in x {
        let next = match prev {
            None => v,
            Some(p) => v * k + p * (1.0 - k),
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// RSI over simple trailing means of the gain/loss split of day-over-day
/// changes. Defined from index `period` on.
///
/// A window without losses gives 100, including a flat window where the
/// average gain is zero as well. Each window is summed on its own so an
/// all-zero loss window is exactly zero whatever came before it.
pub fn rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; prices.len()];
    if period == 0 || prices.len() <= period {
        return out;
    }
    let changes: Vec<(f64, f64)> = prices
        .iter()
        .tuple_windows()
        .map(|(prev, next)| {
            let delta = next - prev;
            (delta.max(0.0), (-delta).max(0.0))
        })
        .collect();
    let p = period as f64;
    // changes[i] belongs to price index i + 1
    for (i, window) in changes.windows(period).enumerate() {
        let avg_gain = window.iter().map(|c| c.0).sum::<f64>() / p;
        let avg_loss = window.iter().map(|c| c.1).sum::<f64>() / p;
        out[i + period] = Some(rsi_from_averages(avg_gain, avg_loss));
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

/// MACD line (EMA fast - EMA slow) and its signal EMA.
pub fn macd(prices: &[f64], fast: usize, slow: usize, signal: usize) -> (Vec<f64>, Vec<f64>) {
    let fast_ema = ema(prices, fast);
    let slow_ema = ema(prices, slow);
    let line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();
    let sig = ema(&line, signal);
    (line, sig)
}

/// All indicator columns for one ticker's price series.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSet {
    pub rsi: Vec<Option<f64>>,
    pub macd: Vec<f64>,
    pub macd_signal: Vec<f64>,
    pub sma_20: Vec<Option<f64>>,
    pub sma_50: Vec<Option<f64>>,
    pub ema_20: Vec<f64>,
    pub ema_50: Vec<f64>,
}

impl IndicatorSet {
    pub fn compute(prices: &[f64]) -> Self {
        let (macd_line, macd_signal) = macd(prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        Self {
            rsi: rsi(prices, RSI_PERIOD),
            macd: macd_line,
            macd_signal,
            sma_20: rolling_ma(prices, 20),
            sma_50: rolling_ma(prices, 50),
            ema_20: ema(prices, 20),
            ema_50: ema(prices, 50),
        }
    }
}

/// Build `asset_prices` rows: one per date x ticker, indicators computed per
/// ticker, market cap broadcast over the ticker's rows. Rows are grouped by
/// ticker in matrix column order, chronological within a ticker.
pub fn build_asset_prices(
    prices: &PriceMatrix,
    volumes: &VolumeMatrix,
    market_caps: &HashMap<String, Option<f64>>,
) -> Vec<AssetPriceRecord> {
    let dates = prices.dates();
    (0..prices.width())
        .into_par_iter()
        .map(|col| {
            let ticker = &prices.tickers()[col];
            let close = prices.column_at(col);
            let volume = volumes.column(ticker);
            let set = IndicatorSet::compute(close);
            let cap = market_caps.get(ticker).copied().flatten();
            dates
                .iter()
                .enumerate()
                .map(|(i, date)| AssetPriceRecord {
                    date: *date,
                    ticker: ticker.clone(),
                    price: close[i],
                    volume: volume.map(|v| v[i]).unwrap_or(0.0),
                    rsi: set.rsi[i],
                    macd: Some(set.macd[i]),
                    macd_signal: Some(set.macd_signal[i]),
                    sma_20: set.sma_20[i],
                    sma_50: set.sma_50[i],
                    ema_20: Some(set.ema_20[i]),
                    ema_50: Some(set.ema_50[i]),
                    market_cap: cap,
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;
    use chrono::NaiveDate;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rolling_ma_warmup() {
        let ma = rolling_ma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(ma[0], None);
        assert_eq!(ma[1], None);
        assert!(approx(ma[2].unwrap(), 2.0));
        assert!(approx(ma[3].unwrap(), 3.0));
    }

    #[test]
    fn test_rolling_ma_opt_nulls_windows_with_holes() {
        let x = [Some(1.0), None, Some(3.0), Some(5.0), Some(7.0)];
        let ma = rolling_ma_opt(&x, 2);
        assert_eq!(ma, vec![None, None, None, Some(4.0), Some(6.0)]);
    }

    #[test]
    fn test_ema_matches_recursive_definition() {
        // span 3 -> k = 0.5
        let e = ema(&[10.0, 11.0, 12.0, 13.0], 3);
        assert!(approx(e[0], 10.0));
        assert!(approx(e[1], 10.5));
        assert!(approx(e[2], 11.25));
        assert!(approx(e[3], 12.125));
    }

    #[test]
    fn test_ema_defined_from_first_sample_sma_is_not() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let set = IndicatorSet::compute(&prices);
        assert_eq!(set.ema_20.len(), prices.len());
        assert!(set.ema_20.iter().all(|v| v.is_finite()));
        assert!(set.sma_20[..19].iter().all(|v| v.is_none()));
        assert!(set.sma_20[19..].iter().all(|v| v.is_some()));
        assert!(set.sma_50.iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_rsi_monotonic_series_is_100() {
        let rising: Vec<f64> = (0..30).map(|i| 10.0 + i as f64).collect();
        let r = rsi(&rising, 14);
        assert!(r[..14].iter().all(|v| v.is_none()));
        assert!(r[14..].iter().all(|v| *v == Some(100.0)));

        let flat = vec![5.0; 20];
        let r = rsi(&flat, 14);
        assert_eq!(r[19], Some(100.0));
    }

    #[test]
    fn test_rsi_after_volatile_history() {
        let mut prices: Vec<f64> = (0..200)
            .map(|i| 100.0 + 37.3 * (1.7 * i as f64).sin() + 0.123 * i as f64)
            .collect();
        let last = *prices.last().unwrap();
        prices.extend(std::iter::repeat_n(last, 30));
        let r = rsi(&prices, 14);
        assert!(r[214..].iter().all(|v| *v == Some(100.0)));

        let mut rising = prices[..200].to_vec();
        rising.extend((1..=30).map(|i| last + i as f64 * 0.7));
        let r = rsi(&rising, 14);
        assert!(r[214..].iter().all(|v| *v == Some(100.0)));
        assert!(r[..200].iter().flatten().all(|v| (0.0..=100.0).contains(v)));
    }

    #[test]
    fn test_rsi_known_value_and_bounds() {
        // alternating +2 / -1 changes: avg gain 1.0, avg loss 0.5 over 14 diffs
        let mut prices = vec![100.0];
        for i in 0..14 {
            let last = *prices.last().unwrap();
            prices.push(if i % 2 == 0 { last + 2.0 } else { last - 1.0 });
        }
        let r = rsi(&prices, 14);
        let v = r[14].unwrap();
        assert!(approx(v, 100.0 - 100.0 / 3.0));

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let r = rsi(&falling, 14);
        assert!(r.iter().flatten().all(|v| (0.0..=100.0).contains(v)));
        assert_eq!(r[20], Some(0.0));
    }

    #[test]
    fn test_macd_signal_is_ema_of_line() {
        let prices: Vec<f64> = (0..60).map(|i| (i as f64 * 0.3).sin() * 10.0 + 50.0).collect();
        let (line, sig) = macd(&prices, 12, 26, 9);
        let expect_line: Vec<f64> = ema(&prices, 12)
            .iter()
            .zip(ema(&prices, 26))
            .map(|(a, b)| a - b)
            .collect();
        assert_eq!(line, expect_line);
        assert_eq!(sig, ema(&line, 9));
        assert!(approx(line[0], 0.0));
    }

    #[test]
    fn test_build_asset_prices_broadcasts_market_cap() {
        let dates: Vec<NaiveDate> = (1..=5)
            .map(|d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap())
            .collect();
        let prices = Matrix::new(
            dates.clone(),
            vec![
                ("BTC-USD".into(), vec![1.0, 2.0, 3.0, 4.0, 5.0]),
                ("ETH-USD".into(), vec![5.0, 4.0, 3.0, 2.0, 1.0]),
            ],
        )
        .unwrap();
        let volumes = Matrix::new(
            dates,
            vec![
                ("BTC-USD".into(), vec![10.0; 5]),
                ("ETH-USD".into(), vec![20.0; 5]),
            ],
        )
        .unwrap();
        let caps = HashMap::from([
            ("BTC-USD".to_string(), Some(1.0e12)),
            ("ETH-USD".to_string(), None),
        ]);
        let rows = build_asset_prices(&prices, &volumes, &caps);
        assert_eq!(rows.len(), 10);
        assert!(rows[..5].iter().all(|r| r.ticker == "BTC-USD" && r.market_cap == Some(1.0e12)));
        assert!(rows[5..].iter().all(|r| r.ticker == "ETH-USD" && r.market_cap.is_none()));
        assert_eq!(rows[6].volume, 20.0);
        assert_eq!(rows[6].price, 4.0);
        assert!(rows.iter().all(|r| r.rsi.is_none()));
    }
}
