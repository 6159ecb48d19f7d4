use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::records::AssetPriceRecord;

/// Feature order every model must be trained on.
pub const FEATURES: [&str; 8] = [
    "RSI",
    "MACD",
    "MACD_Signal",
    "SMA_20",
    "SMA_50",
    "EMA_20",
    "EMA_50",
    "Volume",
];

/// A fitted logistic regression, trained elsewhere and shipped as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub features: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    /// Optional standardisation applied before the linear term.
    #[serde(default)]
    pub mean: Option<Vec<f64>>,
    #[serde(default)]
    pub scale: Option<Vec<f64>>,
}

impl LogisticModel {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read model {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid model {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(text)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.features.len() != FEATURES.len()
            || self.features.iter().zip(FEATURES).any(|(a, b)| a != b)
        {
            bail!(
                "model features {:?} do not match expected {:?}",
                self.features,
                FEATURES
            );
        }
        let n = FEATURES.len();
        if self.coefficients.len() != n {
            bail!("expected {} coefficients, got {}", n, self.coefficients.len());
        }
        for (name, v) in [("mean", &self.mean), ("scale", &self.scale)] {
            if let Some(v) = v
                && v.len() != n
            {
                bail!("expected {} {} values, got {}", n, name, v.len());
            }
        }
        if let Some(scale) = &self.scale
            && scale.iter().any(|s| *s == 0.0)
        {
            bail!("scale must not contain zeros");
        }
        Ok(())
    }

    /// Probability that the next close is above the current one.
    pub fn predict_probability(&self, features: &[f64; 8]) -> f64 {
        let z: f64 = features
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let m = self.mean.as_ref().map_or(0.0, |m| m[i]);
                let s = self.scale.as_ref().map_or(1.0, |s| s[i]);
                self.coefficients[i] * (x - m) / s
            })
            .sum::<f64>()
            + self.intercept;
        1.0 / (1.0 + (-z).exp())
    }
}

/// Feature vector of the most recent row of `ticker`, if every feature is
/// present.
pub fn latest_features(rows: &[AssetPriceRecord], ticker: &str) -> Option<[f64; 8]> {
    let r = rows
        .iter()
        .filter(|r| r.ticker == ticker)
        .max_by_key(|r| r.date)?;
    Some([
        r.rsi?,
        r.macd?,
        r.macd_signal?,
        r.sma_20?,
        r.sma_50?,
        r.ema_20?,
        r.ema_50?,
        r.volume,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const MODEL: &str = r#"{
        "features": ["RSI","MACD","MACD_Signal","SMA_20","SMA_50","EMA_20","EMA_50","Volume"],
        "coefficients": [0.1, 0, 0, 0, 0, 0, 0, 0],
        "intercept": -5.0
    }"#;

    fn row(day: u32, rsi: Option<f64>) -> AssetPriceRecord {
        AssetPriceRecord {
            date: NaiveDate::from_ymd_opt(2024, 4, day).unwrap(),
            ticker: "BTC-USD".into(),
            price: 1.0,
            volume: 3.0,
            rsi,
            macd: Some(0.0),
            macd_signal: Some(0.0),
            sma_20: Some(1.0),
            sma_50: Some(1.0),
            ema_20: Some(1.0),
            ema_50: Some(1.0),
            market_cap: None,
        }
    }

    #[test]
    fn test_probability_is_logistic() {
        let model = LogisticModel::from_json(MODEL).unwrap();
        let mut x = [0.0; 8];
        x[0] = 50.0;
        assert!((model.predict_probability(&x) - 0.5).abs() < 1e-12);
        x[0] = 100.0;
        assert!(model.predict_probability(&x) > 0.99);
    }

    #[test]
    fn test_standardisation_is_applied() {
        let mut model = LogisticModel::from_json(MODEL).unwrap();
        model.intercept = 0.0;
        model.mean = Some(vec![50.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        model.scale = Some(vec![10.0; 8]);
        let mut x = [0.0; 8];
        x[0] = 50.0;
        assert!((model.predict_probability(&x) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_feature_order_is_enforced() {
        let swapped = MODEL.replace(r#""RSI","MACD""#, r#""MACD","RSI""#);
        assert!(LogisticModel::from_json(&swapped).is_err());
        let short = MODEL.replace("0.1, 0, 0,", "0.1, 0,");
        assert!(LogisticModel::from_json(&short).is_err());
    }

    #[test]
    fn test_latest_features() {
        let rows = vec![row(2, Some(55.0)), row(1, Some(40.0))];
        let f = latest_features(&rows, "BTC-USD").unwrap();
        assert_eq!(f[0], 55.0);
        assert_eq!(f[7], 3.0);
        assert!(latest_features(&[row(1, None)], "BTC-USD").is_none());
        assert!(latest_features(&rows, "ETH-USD").is_none());
    }
}
