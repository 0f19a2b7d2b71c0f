//! Linear trend model over daily observations.
//!
//! Fits `value = slope * day + intercept` by ordinary least squares, where
//! `day` is the offset from the first observation. The prediction interval for
//! a target day `x` is
//!
//! ```text
//! ±1.96 · σ · sqrt(1 + 1/n + (x − x̄)² / Sxx)
//! ```
//!
//! with σ the residual standard error. The model is deterministic: the same
//! history and target always give the same result.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::ForecastError;

pub const MODEL_VERSION: &str = "linear-trend-v1";

/// z-score for a two-sided 95% interval.
const Z_95: f64 = 1.96;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub value: f64,
}

impl HistoryPoint {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub predicted_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub model_version: String,
}

/// Result of a least-squares fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendFit {
    pub slope: f64,
    pub intercept: f64,
    pub sigma: f64,
    pub n: usize,
    pub mean_x: f64,
    pub sxx: f64,
}

#[derive(Debug, Clone)]
pub struct LinearTrendModel {
    min_window: usize,
}

impl LinearTrendModel {
    /// `min_window` is clamped to at least 2 points.
    pub fn new(min_window: usize) -> Self {
        Self {
            min_window: min_window.max(2),
        }
    }

    pub fn min_window(&self) -> usize {
        self.min_window
    }

    pub fn version(&self) -> &'static str {
        MODEL_VERSION
    }

    /// Predict the value on `target`. History must be time-ordered with one
    /// point per date.
    pub fn forecast(
        &self,
        history: &[HistoryPoint],
        target: NaiveDate,
    ) -> Result<ForecastResult, ForecastError> {
        if history.len() < self.min_window {
            return Err(ForecastError::InsufficientHistory {
                have: history.len(),
                need: self.min_window,
            });
        }
        let origin = history[0].date;
        let points: Vec<(f64, f64)> = history
            .iter()
            .map(|p| ((p.date - origin).num_days() as f64, p.value))
            .collect();
        let fit = fit_trend(&points).ok_or(ForecastError::DegenerateHistory {
            points: history.len(),
        })?;

        let x = (target - origin).num_days() as f64;
        let point = fit.slope * x + fit.intercept;
        let spread = Z_95
            * fit.sigma
            * (1.0 + 1.0 / fit.n as f64 + (x - fit.mean_x).powi(2) / fit.sxx).sqrt();

        // Counts and durations cannot go negative.
        let predicted = round2(point.max(0.0));
        let lower = round2((point - spread).max(0.0)).min(predicted);
        let upper = round2(point + spread).max(predicted);
        Ok(ForecastResult {
            predicted_value: predicted,
            ci_lower: lower,
            ci_upper: upper,
            model_version: MODEL_VERSION.to_string(),
        })
    }
}

/// Least-squares fit. `None` when every x is identical.
pub fn fit_trend(points: &[(f64, f64)]) -> Option<TrendFit> {
    let n = points.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / nf;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / nf;
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if sxx.abs() < 1e-10 {
        return None;
    }
    let sxy: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_res: f64 = points
        .iter()
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();
    let sigma = if n > 2 { (ss_res / (nf - 2.0)).sqrt() } else { 0.0 };

    Some(TrendFit {
        slope,
        intercept,
        sigma,
        n,
        mean_x,
        sxx,
    })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(n)
    }

    fn history(values: &[f64]) -> Vec<HistoryPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| HistoryPoint::new(day(i as i64), *v))
            .collect()
    }

    #[test]
    fn perfect_line_has_zero_width_interval() {
        let model = LinearTrendModel::new(7);
        let h = history(&[10.0, 12.0, 14.0, 16.0, 18.0, 20.0, 22.0]);
        let r = model.forecast(&h, day(7)).unwrap();
        assert_eq!(r.predicted_value, 24.0);
        assert_eq!(r.ci_lower, 24.0);
        assert_eq!(r.ci_upper, 24.0);
        assert_eq!(r.model_version, MODEL_VERSION);
    }

    #[test]
    fn noisy_history_brackets_the_prediction() {
        let model = LinearTrendModel::new(7);
        let h = history(&[100.0, 130.0, 90.0, 140.0, 120.0, 150.0, 110.0, 160.0]);
        for ahead in 8..15 {
            let r = model.forecast(&h, day(ahead)).unwrap();
            assert!(r.ci_lower <= r.predicted_value);
            assert!(r.predicted_value <= r.ci_upper);
            assert!(r.ci_upper - r.ci_lower > 0.0);
        }
        let near = model.forecast(&h, day(8)).unwrap();
        let far = model.forecast(&h, day(14)).unwrap();
        assert!(far.ci_upper - far.ci_lower > near.ci_upper - near.ci_lower);
    }

    #[test]
    fn short_history_is_insufficient() {
        let model = LinearTrendModel::new(7);
        let err = model.forecast(&history(&[5.0, 6.0]), day(3)).unwrap_err();
        assert_eq!(err, ForecastError::InsufficientHistory { have: 2, need: 7 });
    }

    #[test]
    fn same_day_history_is_degenerate() {
        let model = LinearTrendModel::new(2);
        let h = vec![HistoryPoint::new(day(0), 1.0), HistoryPoint::new(day(0), 2.0)];
        assert_eq!(
            model.forecast(&h, day(1)).unwrap_err(),
            ForecastError::DegenerateHistory { points: 2 }
        );
    }

    #[test]
    fn declining_trend_is_floored_at_zero() {
        let model = LinearTrendModel::new(3);
        let r = model.forecast(&history(&[30.0, 20.0, 10.0, 1.0]), day(10)).unwrap();
        assert_eq!(r.predicted_value, 0.0);
        assert_eq!(r.ci_lower, 0.0);
        assert!(r.ci_upper >= 0.0);
    }

    #[test]
    fn forecasts_are_deterministic() {
        let model = LinearTrendModel::new(7);
        let h = history(&[3.0, 9.0, 4.0, 8.0, 5.0, 7.0, 6.0, 6.5]);
        assert_eq!(model.forecast(&h, day(9)), model.forecast(&h, day(9)));
    }

    #[test]
    fn fit_recovers_slope_and_intercept() {
        let fit = fit_trend(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 1.0).abs() < 1e-9);
        assert!(fit.sigma.abs() < 1e-9);
        assert!(fit_trend(&[(1.0, 1.0), (1.0, 2.0)]).is_none());
    }
}
