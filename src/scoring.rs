//! Scoring engine.
//!
//! Converts the metrics of a probed target into bounded per-dimension
//! scores and a composite. The proxy composite sums four sub-scores:
//! availability (20), speed (30), stability (30) and responsiveness (20).
//! The legacy streaming/gaming/rtc scores are deductions from 100.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scheduler::TargetMetrics;

/// How the `overall` score is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMode {
    #[default]
    Proxy,
    Vpn,
    /// Weighted legacy scores.
    General,
}

impl ScoringMode {
    pub const ALL: [ScoringMode; 3] = [ScoringMode::Proxy, ScoringMode::Vpn, ScoringMode::General];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringMode::Proxy => "proxy",
            ScoringMode::Vpn => "vpn",
            ScoringMode::General => "general",
        }
    }
}

impl fmt::Display for ScoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoringMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScoringMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown scoring mode: {}", s))
    }
}

/// Scores of one target. Every value lies in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoreSet {
    pub availability: u32,
    pub speed: u32,
    pub stability: u32,
    pub responsiveness: u32,
    pub overall: u32,
    pub streaming: u32,
    pub gaming: u32,
    pub rtc: u32,
}

pub const AVAILABILITY_MAX: u32 = 20;
pub const SPEED_MAX: u32 = 30;
pub const STABILITY_MAX: u32 = 30;
pub const RESPONSIVENESS_MAX: u32 = 20;

/// Scoring knobs taken from the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringOptions {
    pub mode: ScoringMode,
    /// When false the HTTP measurement is ignored.
    pub include_http: bool,
}

impl Default for ScoringOptions {
    fn default() -> Self {
        Self {
            mode: ScoringMode::Proxy,
            include_http: true,
        }
    }
}

/// Points for the first `(bound, points)` row with `value < bound`,
/// else `fallback`.
fn below(value: f64, table: &[(f64, u32)], fallback: u32) -> u32 {
    table
        .iter()
        .find(|(bound, _)| value < *bound)
        .map(|(_, points)| *points)
        .unwrap_or(fallback)
}

/// Points for the first `(bound, points)` row with `value >= bound`,
/// else `fallback`.
fn at_least(value: f64, table: &[(f64, u32)], fallback: u32) -> u32 {
    table
        .iter()
        .find(|(bound, _)| value >= *bound)
        .map(|(_, points)| *points)
        .unwrap_or(fallback)
}

/// Deduction of the first `(bound, points)` row with `value > bound`, else 0.
fn deduction(value: f64, table: &[(f64, u32)]) -> u32 {
    table
        .iter()
        .find(|(bound, _)| value > *bound)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

pub fn availability_score(metrics: &TargetMetrics) -> u32 {
    let mut score = 0;
    if metrics.ping_success {
        score += 10;
    }
    if metrics.tcp.success {
        score += 5;
    }
    if let Some(stability) = &metrics.stability {
        let rate = stability.success_rate();
        score += at_least(rate, &[(90.0, 5), (80.0, 4), (70.0, 3)], (rate / 20.0).floor() as u32);
    }
    score.min(AVAILABILITY_MAX)
}

pub fn speed_score(metrics: &TargetMetrics) -> u32 {
    let delay = metrics.avg_delay;
    let mut score = below(
        delay,
        &[(50.0, 15), (100.0, 12), (150.0, 9), (200.0, 6), (300.0, 3)],
        1,
    );

    score += match metrics.download_speed() {
        Some(mbps) => at_least(mbps, &[(5.0, 15), (2.0, 10), (1.0, 6), (0.5, 3)], 1),
        // Latency fills the throughput half when no download was measured.
        None => below(delay, &[(50.0, 15), (100.0, 12), (150.0, 9), (200.0, 6)], 3),
    };
    score.min(SPEED_MAX)
}

pub fn stability_score(metrics: &TargetMetrics) -> u32 {
    let loss = if metrics.loss_rate <= 0.0 {
        10
    } else {
        below(metrics.loss_rate, &[(1.0, 8), (3.0, 6), (5.0, 4), (10.0, 2)], 0)
    };
    let jitter = below(
        metrics.jitter,
        &[(5.0, 10), (10.0, 8), (20.0, 6), (30.0, 4), (50.0, 2)],
        0,
    );
    let connection = metrics.stability.as_ref().map(|s| s.score() / 10).unwrap_or(0);

    (loss + jitter + connection).min(STABILITY_MAX)
}

pub fn responsiveness_score(metrics: &TargetMetrics, include_http: bool) -> u32 {
    let ttfb = metrics
        .http
        .as_ref()
        .filter(|h| include_http && h.success)
        .and_then(|h| h.ttfb_ms)
        .map(|ttfb| {
            below(
                ttfb,
                &[(100.0, 10), (200.0, 8), (300.0, 6), (500.0, 4), (1000.0, 2)],
                0,
            )
        })
        .unwrap_or(0);

    let connect = metrics
        .tcp
        .connect_time_ms
        .filter(|_| metrics.tcp.success)
        .map(|ms| below(ms, &[(50.0, 10), (100.0, 8), (200.0, 6), (300.0, 4), (500.0, 2)], 0))
        .unwrap_or(0);

    (ttfb + connect).min(RESPONSIVENESS_MAX)
}

pub fn streaming_score(metrics: &TargetMetrics) -> u32 {
    let penalty = deduction(metrics.avg_delay, &[(300.0, 50), (200.0, 30), (100.0, 10)])
        + deduction(metrics.loss_rate, &[(5.0, 40), (3.0, 20), (1.0, 10)])
        + deduction(metrics.jitter, &[(100.0, 20), (50.0, 10)]);
    100u32.saturating_sub(penalty)
}

pub fn gaming_score(metrics: &TargetMetrics) -> u32 {
    let penalty = deduction(metrics.loss_rate, &[(2.0, 40), (1.0, 20), (0.5, 10)])
        + deduction(metrics.avg_delay, &[(150.0, 30), (100.0, 20), (50.0, 10)])
        + deduction(metrics.jitter, &[(50.0, 20), (20.0, 10)]);
    100u32.saturating_sub(penalty)
}

pub fn rtc_score(metrics: &TargetMetrics) -> u32 {
    let penalty = deduction(metrics.loss_rate, &[(1.0, 30), (0.5, 20), (0.1, 10)])
        + deduction(metrics.jitter, &[(30.0, 30), (20.0, 20), (10.0, 10)])
        + deduction(metrics.avg_delay, &[(200.0, 20), (150.0, 15), (100.0, 10)]);
    100u32.saturating_sub(penalty)
}

/// Score a successfully probed target.
pub fn score(metrics: &TargetMetrics, options: ScoringOptions) -> ScoreSet {
    let mut set = ScoreSet {
        availability: availability_score(metrics),
        speed: speed_score(metrics),
        stability: stability_score(metrics),
        responsiveness: responsiveness_score(metrics, options.include_http),
        streaming: streaming_score(metrics),
        gaming: gaming_score(metrics),
        rtc: rtc_score(metrics),
        overall: 0,
    };

    set.overall = match options.mode {
        ScoringMode::Proxy | ScoringMode::Vpn => {
            set.availability + set.speed + set.stability + set.responsiveness
        }
        ScoringMode::General => {
            (3 * set.streaming + 3 * set.gaming + 4 * set.rtc) / 10
        }
    }
    .min(100);

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{DownloadSample, HttpSample, StabilitySample, TcpSample};

    fn metrics(delay: f64, loss: f64, jitter: f64) -> TargetMetrics {
        TargetMetrics {
            avg_delay: delay,
            loss_rate: loss,
            jitter,
            ping_success: true,
            tcp: TcpSample::connected(30.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_excellent_target_scores_full_marks() {
        let mut m = metrics(20.0, 0.0, 2.0);
        m.http = Some(HttpSample {
            ttfb_ms: Some(50.0),
            total_time_ms: Some(60.0),
            status_code: Some(204),
            success: true,
            failure_reason: None,
        });
        m.stability = Some(StabilitySample {
            attempts: 10,
            successes: 10,
            connect_times: vec![30.0; 10],
        });
        m.download = Some(DownloadSample {
            bytes: 60_000_000,
            elapsed_ms: 10_000.0,
            status_code: Some(200),
        });

        let scores = score(&m, ScoringOptions::default());
        assert_eq!(scores.availability, 20);
        assert_eq!(scores.speed, 30);
        assert_eq!(scores.stability, 30);
        assert_eq!(scores.responsiveness, 20);
        assert_eq!(scores.overall, 100);
        assert_eq!(scores.streaming, 100);
        assert_eq!(scores.gaming, 100);
        assert_eq!(scores.rtc, 100);
    }

    #[test]
    fn test_latency_fills_speed_without_download() {
        let m = metrics(120.0, 0.0, 1.0);
        // 9 for latency, 9 again for the missing throughput half
        assert_eq!(speed_score(&m), 18);

        let slow = metrics(250.0, 0.0, 1.0);
        assert_eq!(speed_score(&slow), 3 + 3);
    }

    #[test]
    fn test_missing_inputs_score_zero_not_failure() {
        let mut m = metrics(40.0, 0.0, 1.0);
        m.tcp = TcpSample::failed("refused");
        assert_eq!(availability_score(&m), 10);
        assert_eq!(responsiveness_score(&m, true), 0);
        // no stability probe, so only loss and jitter count
        assert_eq!(stability_score(&m), 20);
    }

    #[test]
    fn test_http_can_be_excluded() {
        let mut m = metrics(40.0, 0.0, 1.0);
        m.http = Some(HttpSample {
            ttfb_ms: Some(150.0),
            total_time_ms: Some(160.0),
            status_code: Some(204),
            success: true,
            failure_reason: None,
        });
        assert_eq!(responsiveness_score(&m, true), 8 + 10);
        assert_eq!(responsiveness_score(&m, false), 10);
    }

    #[test]
    fn test_availability_stability_rate_ladder() {
        let mut m = metrics(40.0, 0.0, 1.0);
        m.stability = Some(StabilitySample {
            attempts: 10,
            successes: 5,
            connect_times: vec![30.0; 5],
        });
        // floor(50 / 20) = 2
        assert_eq!(availability_score(&m), 17);
    }

    #[test]
    fn test_legacy_scores_clamp_at_zero() {
        let terrible = metrics(800.0, 50.0, 200.0);
        assert_eq!(streaming_score(&terrible), 0);
        assert_eq!(gaming_score(&terrible), 10);
        assert_eq!(rtc_score(&terrible), 20);

        let mid = metrics(120.0, 0.8, 25.0);
        assert_eq!(streaming_score(&mid), 100 - 10);
        assert_eq!(gaming_score(&mid), 100 - 10 - 20 - 10);
        assert_eq!(rtc_score(&mid), 100 - 20 - 20 - 10);
    }

    #[test]
    fn test_general_mode_weights_legacy_scores() {
        let m = metrics(120.0, 0.8, 25.0);
        let scores = score(
            &m,
            ScoringOptions {
                mode: ScoringMode::General,
                include_http: true,
            },
        );
        // 0.3 * 90 + 0.3 * 60 + 0.4 * 50 = 65
        assert_eq!(scores.overall, 65);
    }

    #[test]
    fn test_scores_stay_in_range() {
        for delay in [0.0, 49.9, 150.0, 1000.0, 10_000.0] {
            for loss in [0.0, 0.5, 4.0, 9.9, 100.0] {
                for jitter in [0.0, 12.0, 500.0] {
                    let s = score(&metrics(delay, loss, jitter), ScoringOptions::default());
                    for v in [
                        s.availability,
                        s.speed,
                        s.stability,
                        s.responsiveness,
                        s.overall,
                        s.streaming,
                        s.gaming,
                        s.rtc,
                    ] {
                        assert!(v <= 100);
                    }
                    assert!(s.availability <= AVAILABILITY_MAX);
                    assert!(s.speed <= SPEED_MAX);
                    assert!(s.stability <= STABILITY_MAX);
                    assert!(s.responsiveness <= RESPONSIVENESS_MAX);
                }
            }
        }
    }

    #[test]
    fn test_scoring_mode_parse() {
        assert_eq!("VPN".parse::<ScoringMode>().unwrap(), ScoringMode::Vpn);
        assert!("fastest".parse::<ScoringMode>().is_err());
    }
}
