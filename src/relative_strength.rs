use rayon::prelude::*;
use tracing::info;

use crate::cancel::CancelToken;
use crate::correlation::column_pairs;
use crate::error::{PipelineError, Stage};
use crate::indicators::rolling_ma_opt;
use crate::matrix::PriceMatrix;
use crate::records::{RelativeStrengthRecord, pair_label};

/// `base / quote` per date. A zero or non-finite quote gives `None`.
pub fn ratio_series(base: &[f64], quote: &[f64]) -> Vec<Option<f64>> {
    base.iter()
        .zip(quote.iter())
        .map(|(b, q)| {
            if *q == 0.0 {
                return None;
            }
            let r = b / q;
            r.is_finite().then_some(r)
        })
        .collect()
}

/// Long-format relative strength for every combination, one direction
/// only: the earlier matrix column is the base. Output order: pair, then
/// window, then date.
///
/// Pairs go to the rayon pool a few per worker at a time; the cancel token
/// is checked between those batches.
pub fn compute_all(
    prices: &PriceMatrix,
    windows: &[usize],
    cancel: &CancelToken,
) -> Result<Vec<RelativeStrengthRecord>, PipelineError> {
    let pairs = column_pairs(prices.width());
    let dates = prices.dates();
    let tickers = prices.tickers();
    let batch = rayon::current_num_threads().max(1) * 4;
    let mut out = Vec::with_capacity(pairs.len() * windows.len() * dates.len());

    info!(
        "relative strength across {} pairs x {} windows",
        pairs.len(),
        windows.len()
    );
    for chunk in pairs.chunks(batch) {
        cancel.check(Stage::Compute)?;
        let shards: Vec<Vec<RelativeStrengthRecord>> = chunk
            .par_iter()
            .map(|&(i, j)| {
                let (base, quote) = (&tickers[i], &tickers[j]);
                let label = pair_label(base, quote);
                let rs = ratio_series(prices.column_at(i), prices.column_at(j));
                let mut rows = Vec::with_capacity(windows.len() * dates.len());
                for &window in windows {
                    let smooth = rolling_ma_opt(&rs, window);
                    rows.extend(dates.iter().enumerate().map(|(t, date)| {
                        RelativeStrengthRecord {
                            date: *date,
                            pair: label.clone(),
                            base: base.clone(),
                            quote: quote.clone(),
                            window: window as u32,
                            rs: rs[t],
                            rs_smooth: smooth[t],
                        }
                    }));
                }
                rows
            })
            .collect();
        out.extend(shards.into_iter().flatten());
    }
    Ok(out)
}
