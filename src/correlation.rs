use itertools::Itertools;
use rayon::prelude::*;
use tracing::info;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Stage};
use crate::matrix::PriceMatrix;
use crate::records::{CorrelationRecord, pair_label};

// window variance below this fraction of the window's raw second moment is
// treated as a constant series
const DEGENERATE_VARIANCE: f64 = 1e-12;
// rebuild the sums once values seen since the last rebuild dwarf the window
const REBUILD_RATIO: f64 = 1e4;

/// Unordered column pairs `(i, j)` with `i < j`, in matrix column order.
pub fn column_pairs(width: usize) -> Vec<(usize, usize)> {
    (0..width).tuple_combinations().collect()
}

/// Running sums of one window, taken relative to an anchor level.
#[derive(Debug, Default, Clone, Copy)]
struct WindowSums {
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
    // largest squared deviation added since the last rebuild
    peak_x: f64,
    peak_y: f64,
}

impl WindowSums {
    fn over(x: &[f64], y: &[f64], ox: f64, oy: f64) -> Self {
        let mut sums = Self::default();
        for (a, b) in x.iter().zip(y) {
            sums.add(a - ox, b - oy);
        }
        sums
    }

    fn add(&mut self, a: f64, b: f64) {
        self.sx += a;
        self.sy += b;
        self.sxx += a * a;
        self.syy += b * b;
        self.sxy += a * b;
        self.peak_x = self.peak_x.max(a * a);
        self.peak_y = self.peak_y.max(b * b);
    }

    fn remove(&mut self, a: f64, b: f64) {
        self.sx -= a;
        self.sy -= b;
        self.sxx -= a * a;
        self.syy -= b * b;
        self.sxy -= a * b;
    }

    fn is_stale(&self) -> bool {
        self.peak_x > REBUILD_RATIO * self.sxx || self.peak_y > REBUILD_RATIO * self.syy
    }

    fn pearson(&self, n: f64) -> Option<f64> {
        let var_x = self.sxx - self.sx * self.sx / n;
        let var_y = self.syy - self.sy * self.sy / n;
        let cov = self.sxy - self.sx * self.sy / n;
        if var_x <= DEGENERATE_VARIANCE * self.sxx.max(f64::MIN_POSITIVE)
            || var_y <= DEGENERATE_VARIANCE * self.syy.max(f64::MIN_POSITIVE)
        {
            return None;
        }
        let r = cov / (var_x * var_y).sqrt();
        r.is_finite().then(|| r.clamp(-1.0, 1.0))
    }
}

/// Trailing Pearson correlation of `x` and `y` over `window` observations,
/// re-estimated at every index. `None` before `window - 1` and wherever
/// either series is constant inside the window.
///
/// Sums are taken relative to a recent observation. They are rebuilt from
/// the raw window every `window` steps, and sooner when values that have
/// already left the window were orders of magnitude larger than the
/// current ones (a level shift), so the sums stay on the current scale.
pub fn rolling_correlation(x: &[f64], y: &[f64], window: usize) -> Vec<Option<f64>> {
    let n = x.len().min(y.len());
    let mut out = vec![None; n];
    if window < 2 || n < window {
        return out;
    }
    let w = window as f64;
    let mut sums = WindowSums::default();
    let (mut ox, mut oy) = (0.0, 0.0);
    for i in 0..n {
        let lo = (i + 1).saturating_sub(window);
        if i % window == 0 {
            (ox, oy) = (x[i], y[i]);
            sums = WindowSums::over(&x[lo..i], &y[lo..i], ox, oy);
        } else if i >= window {
            sums.remove(x[i - window] - ox, y[i - window] - oy);
        }
        sums.add(x[i] - ox, y[i] - oy);
        if i + 1 < window {
            continue;
        }
        if sums.is_stale() {
            (ox, oy) = (x[i], y[i]);
            sums = WindowSums::over(&x[lo..=i], &y[lo..=i], ox, oy);
        }
        out[i] = sums.pearson(w);
    }
    out
}

/// Long-format rolling correlation for every unordered pair and window.
///
/// Windows are processed one at a time (cancellation is checked between
/// them); within a window the pairs are sharded across the rayon pool and
/// merged back in pair order. Output order: window, then pair, then date.
pub fn compute_all(
    prices: &PriceMatrix,
    windows: &[usize],
    cancel: &CancelToken,
) -> Result<Vec<CorrelationRecord>, PipelineError> {
    let pairs = column_pairs(prices.width());
    let labels: Vec<String> = pairs
        .iter()
        .map(|&(i, j)| pair_label(&prices.tickers()[i], &prices.tickers()[j]))
        .collect();
    let dates = prices.dates();
    let mut out = Vec::with_capacity(pairs.len() * windows.len() * dates.len());

    for &window in windows {
        cancel.check(Stage::Compute)?;
        info!(
            "correlation window {}d across {} pairs",
            window,
            pairs.len()
        );
        let shards: Vec<Vec<CorrelationRecord>> = pairs
            .par_iter()
            .zip(labels.par_iter())
            .map(|(&(i, j), label)| {
                rolling_correlation(prices.column_at(i), prices.column_at(j), window)
                    .into_iter()
                    .zip(dates.iter())
                    .map(|(value, date)| CorrelationRecord {
                        date: *date,
                        pair: label.clone(),
                        window: window as u32,
                        rolling_correlation: value,
                    })
                    .collect()
            })
            .collect();
        out.extend(shards.into_iter().flatten());
    }
    Ok(out)
}
