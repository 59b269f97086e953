//! Outlier filters for repeated measurements.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{mean, median, stdev};

/// Outlier filtering method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierMethod {
    /// Interquartile range fences at 1.5·IQR.
    #[default]
    Iqr,
    /// Drop values more than 2.5 standard deviations from the mean.
    ZScore,
    /// Modified z-score over the median absolute deviation.
    Mad,
}

impl OutlierMethod {
    pub const ALL: [OutlierMethod; 3] = [OutlierMethod::Iqr, OutlierMethod::ZScore, OutlierMethod::Mad];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutlierMethod::Iqr => "iqr",
            OutlierMethod::ZScore => "zscore",
            OutlierMethod::Mad => "mad",
        }
    }
}

impl fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutlierMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutlierMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown outlier filter method: {}", s))
    }
}

const ZSCORE_THRESHOLD: f64 = 2.5;
const MAD_THRESHOLD: f64 = 3.5;
const MAD_SCALE: f64 = 0.6745;

/// Remove outliers from `values`.
///
/// Inputs with fewer than 3 values are returned unchanged, and a filter
/// that would drop everything returns the input instead, so a non-empty
/// input never yields an empty output.
pub fn filter_outliers(values: &[f64], method: OutlierMethod) -> Vec<f64> {
    if values.len() < 3 {
        return values.to_vec();
    }

    let filtered = match method {
        OutlierMethod::Iqr => filter_iqr(values),
        OutlierMethod::ZScore => filter_zscore(values),
        OutlierMethod::Mad => filter_mad(values),
    };

    if filtered.is_empty() {
        values.to_vec()
    } else {
        filtered
    }
}

/// Q1/Q3 taken at the `n/4` and `3n/4` indices of the sorted values.
pub fn quartiles(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    Some((sorted[n / 4], sorted[3 * n / 4]))
}

fn filter_iqr(values: &[f64]) -> Vec<f64> {
    let Some((q1, q3)) = quartiles(values) else {
        return Vec::new();
    };
    let iqr = q3 - q1;
    let lower = q1 - 1.5 * iqr;
    let upper = q3 + 1.5 * iqr;

    values
        .iter()
        .copied()
        .filter(|v| (lower..=upper).contains(v))
        .collect()
}

fn filter_zscore(values: &[f64]) -> Vec<f64> {
    let (Some(mean), Some(sd)) = (mean(values), stdev(values)) else {
        return values.to_vec();
    };
    if sd == 0.0 {
        return values.to_vec();
    }

    values
        .iter()
        .copied()
        .filter(|v| ((v - mean) / sd).abs() <= ZSCORE_THRESHOLD)
        .collect()
}

fn filter_mad(values: &[f64]) -> Vec<f64> {
    let Some(med) = median(values) else {
        return values.to_vec();
    };
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&deviations).unwrap_or(0.0);
    if mad == 0.0 {
        return values.to_vec();
    }

    values
        .iter()
        .copied()
        .filter(|v| (MAD_SCALE * (v - med) / mad).abs() <= MAD_THRESHOLD)
        .collect()
}
