//! Momentum model over a numeric series
//!
//! Expects `payload.series` to be an array of numbers, oldest first. The
//! forecast extends the last value by the gap between a fast and a slow EMA;
//! confidence grows with how far RSI sits from neutral and shrinks for short
//! series.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Model;
use crate::types::ModelOutput;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    #[serde(default = "default_fast")]
    pub fast_period: usize,
    #[serde(default = "default_slow")]
    pub slow_period: usize,
    #[serde(default = "default_rsi")]
    pub rsi_period: usize,
    /// Series shorter than this are rejected; never less than one point
    #[serde(default = "default_min_points")]
    pub min_points: usize,
}

fn default_fast() -> usize { 12 }
fn default_slow() -> usize { 26 }
fn default_rsi() -> usize { 14 }
fn default_min_points() -> usize { 2 }

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast(),
            slow_period: default_slow(),
            rsi_period: default_rsi(),
            min_points: default_min_points(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MomentumModel {
    config: MomentumConfig,
}

impl MomentumModel {
    pub fn new(config: MomentumConfig) -> Self {
        Self {
            config: MomentumConfig {
                min_points: config.min_points.max(1),
                ..config
            },
        }
    }

    fn forecast(&self, series: &[f64]) -> Result<ModelOutput> {
        if series.len() < self.config.min_points {
            anyhow::bail!(
                "series has {} points, need at least {}",
                series.len(),
                self.config.min_points
            );
        }

        let last = *series.last().context("series is empty")?;
        let fast = ema(series, self.config.fast_period);
        let slow = ema(series, self.config.slow_period);
        let value = last + (fast - slow);

        let rsi = rsi(series, self.config.rsi_period);
        let coverage = (series.len() as f64 / self.config.slow_period.max(1) as f64).min(1.0);
        let confidence = ((rsi - 50.0).abs() / 50.0) * coverage;

        Ok(ModelOutput::new(value, confidence))
    }
}

#[async_trait]
impl Model for MomentumModel {
    async fn compute(&self, payload: &serde_json::Value) -> Result<ModelOutput> {
        let series: Vec<f64> = payload
            .get("series")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("payload.series must be an array of numbers")?
            .context("payload has no 'series' field")?;

        if series.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("series contains non-finite values");
        }

        self.forecast(&series)
    }

    fn name(&self) -> &'static str {
        "momentum"
    }
}

/// Final value of the exponential moving average
fn ema(series: &[f64], period: usize) -> f64 {
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut iter = series.iter();
    let first = iter.next().copied().unwrap_or(0.0);
    iter.fold(first, |acc, &price| price * multiplier + acc * (1.0 - multiplier))
}

/// Relative strength index over the last `period` changes; 50 when too short
fn rsi(series: &[f64], period: usize) -> f64 {
    if period == 0 || series.len() < period + 1 {
        return 50.0;
    }
    let window = &series[series.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), pair| {
        let diff = pair[1] - pair[0];
        if diff >= 0.0 { (g + diff, l) } else { (g, l - diff) }
    });
    if losses == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + gains / losses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_rising_series_forecasts_higher() {
        let model = MomentumModel::default();
        let series: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let out = model.compute(&json!({ "series": series })).await.unwrap();
        assert!(out.value > 40.0);
        assert!(out.confidence > 0.9);
    }

    #[tokio::test]
    async fn test_flat_series_has_no_drift() {
        let model = MomentumModel::default();
        let out = model.compute(&json!({ "series": [5.0, 5.0, 5.0, 5.0] })).await.unwrap();
        assert!((out.value - 5.0).abs() < 1e-9);
        assert!(out.confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_rejects_bad_payloads() {
        let model = MomentumModel::default();
        assert!(model.compute(&json!({})).await.is_err());
        assert!(model.compute(&json!({ "series": "up" })).await.is_err());
        assert!(model.compute(&json!({ "series": [1.0] })).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_min_points_still_rejects_empty_series() {
        let model = MomentumModel::new(MomentumConfig {
            min_points: 0,
            ..Default::default()
        });
        let err = model.compute(&json!({ "series": [] })).await.unwrap_err();
        assert!(err.to_string().contains("need at least 1"));

        let out = model.compute(&json!({ "series": [3.0] })).await.unwrap();
        assert!((out.value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_bounds() {
        assert_eq!(rsi(&[1.0, 2.0], 14), 50.0);
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert_eq!(rsi(&falling, 14), 0.0);
    }
}
