use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::records::{AssetPriceRecord, CorrelationRecord, RelativeStrengthRecord};

pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub ticker: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrengthSnapshot {
    pub pair: String,
    pub window: u32,
    pub rs: Option<f64>,
    pub rs_smooth: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSnapshot {
    pub pair: String,
    pub window: u32,
    pub correlation: Option<f64>,
}

/// Fixed-shape context describing the latest state of every table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSummary {
    pub schema_version: u32,
    pub prices_as_of: Option<NaiveDate>,
    pub relative_strength_as_of: Option<NaiveDate>,
    pub correlation_as_of: Option<NaiveDate>,
    pub latest_prices: Vec<PriceSnapshot>,
    pub latest_relative_strength: Vec<StrengthSnapshot>,
    pub latest_correlations: Vec<CorrelationSnapshot>,
}

fn latest<'a, T>(
    rows: &'a [T],
    date: impl Fn(&T) -> NaiveDate,
) -> (Option<NaiveDate>, Vec<&'a T>) {
    let Some(last) = rows.iter().map(&date).max() else {
        return (None, Vec::new());
    };
    (Some(last), rows.iter().filter(|r| date(r) == last).collect())
}

/// Build the summary from full table contents. Each section keeps at most
/// `limit` rows of its table's latest date, in stored order.
pub fn build_summary(
    prices: &[AssetPriceRecord],
    relative_strength: &[RelativeStrengthRecord],
    correlations: &[CorrelationRecord],
    limit: usize,
) -> DataSummary {
    let (prices_as_of, p) = latest(prices, |r| r.date);
    let (relative_strength_as_of, rs) = latest(relative_strength, |r| r.date);
    let (correlation_as_of, c) = latest(correlations, |r| r.date);
    DataSummary {
        schema_version: SUMMARY_SCHEMA_VERSION,
        prices_as_of,
        relative_strength_as_of,
        correlation_as_of,
        latest_prices: p
            .into_iter()
            .take(limit)
            .map(|r| PriceSnapshot {
                ticker: r.ticker.clone(),
                price: r.price,
            })
            .collect(),
        latest_relative_strength: rs
            .into_iter()
            .take(limit)
            .map(|r| StrengthSnapshot {
                pair: r.pair.clone(),
                window: r.window,
                rs: r.rs,
                rs_smooth: r.rs_smooth,
            })
            .collect(),
        latest_correlations: c
            .into_iter()
            .take(limit)
            .map(|r| CorrelationSnapshot {
                pair: r.pair.clone(),
                window: r.window,
                correlation: r.rolling_correlation,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, day).unwrap()
    }

    #[test]
    fn test_summary_keeps_latest_rows_only() {
        let corr = |day, pair: &str| CorrelationRecord {
            date: d(day),
            pair: pair.into(),
            window: 30,
            rolling_correlation: Some(0.4),
        };
        let correlations = vec![corr(1, "A/B"), corr(2, "A/B"), corr(2, "A/C"), corr(2, "B/C")];
        let s = build_summary(&[], &[], &correlations, 2);
        assert_eq!(s.schema_version, 1);
        assert_eq!(s.correlation_as_of, Some(d(2)));
        assert_eq!(s.prices_as_of, None);
        assert!(s.latest_prices.is_empty());
        let pairs: Vec<&str> = s.latest_correlations.iter().map(|c| c.pair.as_str()).collect();
        assert_eq!(pairs, vec!["A/B", "A/C"]);
    }

    #[test]
    fn test_summary_json_shape_is_stable() {
        let s = build_summary(&[], &[], &[], 5);
        let json = serde_json::to_value(&s).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        for k in [
            "schema_version",
            "prices_as_of",
            "relative_strength_as_of",
            "correlation_as_of",
            "latest_prices",
            "latest_relative_strength",
            "latest_correlations",
        ] {
            assert!(keys.contains(&k), "missing {k}");
        }
        assert_eq!(json["schema_version"], 1);
    }
}
