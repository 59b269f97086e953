//! Statistical aggregation of repeated measurements.
//!
//! Filters outliers out of noisy samples and combines multiple probe
//! rounds into a single point estimate with a confidence interval.

mod outliers;

pub use outliers::*;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Aggregation error types.
#[derive(Error, Debug, PartialEq)]
pub enum AggregationError {
    #[error("no samples collected for {metric}")]
    InsufficientData { metric: &'static str },
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Sample standard deviation (n - 1 denominator). Needs two values.
pub fn stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Coefficient of variation in percent; zero for a zero mean or a single value.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    match (mean(values), stdev(values)) {
        (Some(m), Some(sd)) if m != 0.0 => sd / m * 100.0,
        _ => 0.0,
    }
}

/// Two-sided confidence interval of the mean.
///
/// Uses the normal approximation above 30 samples and a fixed small-sample
/// t-table (keyed by sample count) otherwise. A single value yields the
/// degenerate interval `(x, x)`.
pub fn confidence_interval(values: &[f64], confidence: f64) -> Option<(f64, f64)> {
    let m = mean(values)?;
    let n = values.len();
    let Some(sd) = stdev(values) else {
        return Some((m, m));
    };

    let se = sd / (n as f64).sqrt();
    let critical = if n > 30 {
        if confidence >= 0.99 {
            2.576
        } else if confidence >= 0.95 {
            1.96
        } else {
            1.645
        }
    } else {
        t_value(n)
    };

    let margin = critical * se;
    Some((m - margin, m + margin))
}

fn t_value(n: usize) -> f64 {
    match n {
        2 => 12.706,
        3 => 4.303,
        4 => 3.182,
        5 => 2.776,
        6 => 2.571,
        7 => 2.447,
        8 => 2.365,
        9 => 2.306,
        10 => 2.262,
        _ => 2.0,
    }
}

/// Stability score in `[0, 100]` from a coefficient of variation (percent).
pub fn stability_score_from_cv(cv: f64) -> u32 {
    let score = if cv < 5.0 {
        100.0 - cv
    } else if cv < 10.0 {
        90.0 - (cv - 5.0) * 2.0
    } else if cv < 20.0 {
        80.0 - (cv - 10.0) * 2.0
    } else if cv < 30.0 {
        60.0 - (cv - 20.0) * 2.0
    } else {
        (40.0 - (cv - 30.0)).max(0.0)
    };
    score.clamp(0.0, 100.0) as u32
}

/// Measurements from one deep-probe round. Absent values were not measured.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoundMetrics {
    pub avg_delay: Option<f64>,
    pub loss_rate: Option<f64>,
    pub jitter: Option<f64>,
    pub tcp_connect_ms: Option<f64>,
    pub http_ttfb_ms: Option<f64>,
    pub http_total_ms: Option<f64>,
}

/// A per-round metric that can be aggregated across rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    AvgDelay,
    LossRate,
    Jitter,
    TcpConnect,
    HttpTtfb,
    HttpTotal,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::AvgDelay => "avg_delay",
            Metric::LossRate => "loss_rate",
            Metric::Jitter => "jitter",
            Metric::TcpConnect => "tcp_connect",
            Metric::HttpTtfb => "http_ttfb",
            Metric::HttpTotal => "http_total",
        }
    }

    pub fn extract(&self, round: &RoundMetrics) -> Option<f64> {
        match self {
            Metric::AvgDelay => round.avg_delay,
            Metric::LossRate => round.loss_rate,
            Metric::Jitter => round.jitter,
            Metric::TcpConnect => round.tcp_connect_ms,
            Metric::HttpTtfb => round.http_ttfb_ms,
            Metric::HttpTotal => round.http_total_ms,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A metric combined over several rounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedMetric {
    /// Mean of the values that survived outlier filtering.
    pub value: f64,
    pub confidence_interval: (f64, f64),
    pub filtered_count: usize,
    pub original_count: usize,
    pub cv: f64,
}

/// Combine `metric` over `rounds`: extract, filter outliers, take the mean.
pub fn aggregate_rounds(
    rounds: &[RoundMetrics],
    metric: Metric,
    method: OutlierMethod,
    confidence: f64,
) -> Result<AggregatedMetric, AggregationError> {
    let values: Vec<f64> = rounds
        .iter()
        .filter_map(|r| metric.extract(r))
        .filter(|v| v.is_finite())
        .collect();

    let filtered = filter_outliers(&values, method);
    let (Some(value), Some(confidence_interval)) =
        (mean(&filtered), confidence_interval(&filtered, confidence))
    else {
        return Err(AggregationError::InsufficientData {
            metric: metric.name(),
        });
    };

    Ok(AggregatedMetric {
        value,
        confidence_interval,
        filtered_count: filtered.len(),
        original_count: values.len(),
        cv: coefficient_of_variation(&filtered),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_basic_statistics() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(approx(mean(&values).unwrap(), 5.0));
        assert!(approx(median(&values).unwrap(), 4.5));
        assert!(approx(stdev(&values).unwrap(), (32.0f64 / 7.0).sqrt()));
        let (q1, q3) = quartiles(&values).unwrap();
        assert!(approx(q1, 4.0));
        assert!(approx(q3, 7.0));
        assert_eq!(mean(&[]), None);
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_stdev_needs_two_values() {
        assert_eq!(stdev(&[3.0]), None);
        assert_eq!(coefficient_of_variation(&[3.0]), 0.0);
    }

    #[test]
    fn test_confidence_interval_small_sample() {
        let values = [10.0, 12.0, 11.0];
        let (low, high) = confidence_interval(&values, 0.95).unwrap();
        // mean 11, sd 1, se 1/sqrt(3), t(3) = 4.303
        let margin = 4.303 / 3f64.sqrt();
        assert!(approx(low, 11.0 - margin));
        assert!(approx(high, 11.0 + margin));
    }

    #[test]
    fn test_confidence_interval_large_sample_uses_normal() {
        let values: Vec<f64> = (0..40).map(|i| (i % 4) as f64).collect();
        let m = mean(&values).unwrap();
        let se = stdev(&values).unwrap() / 40f64.sqrt();

        let (low, high) = confidence_interval(&values, 0.99).unwrap();
        assert!(approx(high - m, 2.576 * se));
        assert!(approx(m - low, 2.576 * se));

        let (_, high) = confidence_interval(&values, 0.95).unwrap();
        assert!(approx(high - m, 1.96 * se));

        let (_, high) = confidence_interval(&values, 0.90).unwrap();
        assert!(approx(high - m, 1.645 * se));
    }

    #[test]
    fn test_confidence_interval_edges() {
        assert_eq!(confidence_interval(&[], 0.95), None);
        assert_eq!(confidence_interval(&[7.0], 0.95), Some((7.0, 7.0)));

        // Beyond the t-table but not yet normal: default critical value 2.0.
        let values: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let m = mean(&values).unwrap();
        let se = stdev(&values).unwrap() / 20f64.sqrt();
        let (_, high) = confidence_interval(&values, 0.95).unwrap();
        assert!(approx(high - m, 2.0 * se));
    }

    #[test]
    fn test_stability_score_from_cv() {
        assert_eq!(stability_score_from_cv(0.0), 100);
        assert_eq!(stability_score_from_cv(4.0), 96);
        assert_eq!(stability_score_from_cv(5.0), 90);
        assert_eq!(stability_score_from_cv(7.5), 85);
        assert_eq!(stability_score_from_cv(15.0), 70);
        assert_eq!(stability_score_from_cv(25.0), 50);
        assert_eq!(stability_score_from_cv(35.0), 35);
        assert_eq!(stability_score_from_cv(90.0), 0);
    }

    #[test]
    fn test_stability_score_is_monotonic() {
        let mut last = u32::MAX;
        for i in 0..1000 {
            let score = stability_score_from_cv(i as f64 / 10.0);
            assert!(score <= last, "score rose at cv={}", i as f64 / 10.0);
            assert!(score <= 100);
            last = score;
        }
    }

    #[test]
    fn test_aggregate_rounds_filters_spike() {
        let rounds: Vec<RoundMetrics> = [100.0, 102.0, 98.0, 200.0, 101.0]
            .iter()
            .map(|&d| RoundMetrics {
                avg_delay: Some(d),
                loss_rate: Some(0.0),
                ..Default::default()
            })
            .collect();

        let agg = aggregate_rounds(&rounds, Metric::AvgDelay, OutlierMethod::Iqr, 0.95).unwrap();
        assert_eq!(agg.original_count, 5);
        assert_eq!(agg.filtered_count, 4);
        assert!(approx(agg.value, 100.25));
        assert!(agg.confidence_interval.0 < agg.value);
        assert!(agg.confidence_interval.1 > agg.value);
    }

    #[test]
    fn test_aggregate_rounds_skips_missing_values() {
        let rounds = vec![
            RoundMetrics {
                tcp_connect_ms: Some(40.0),
                ..Default::default()
            },
            RoundMetrics::default(),
            RoundMetrics {
                tcp_connect_ms: Some(44.0),
                ..Default::default()
            },
        ];
        let agg = aggregate_rounds(&rounds, Metric::TcpConnect, OutlierMethod::Mad, 0.95).unwrap();
        assert_eq!(agg.original_count, 2);
        assert!(approx(agg.value, 42.0));
    }

    #[test]
    fn test_aggregate_rounds_insufficient_data() {
        let rounds = vec![RoundMetrics::default(); 3];
        assert_eq!(
            aggregate_rounds(&rounds, Metric::HttpTtfb, OutlierMethod::Iqr, 0.95),
            Err(AggregationError::InsufficientData { metric: "http_ttfb" })
        );
    }
}
