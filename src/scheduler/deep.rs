//! Phase 2: full probe set over screened targets.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{run_phase, Interruption, PhaseResult};
use crate::config::RunConfig;
use crate::probe::{ping_budget, DownloadSample, HttpSample, PingSample, Prober, StabilitySample, TcpSample};
use crate::stats::{self, AggregatedMetric, Metric, RoundMetrics};
use crate::targets::Target;

const MAX_START_JITTER_MS: u64 = 100;

/// Measurements of one successfully probed target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetMetrics {
    /// Mean round-trip time in milliseconds.
    pub avg_delay: f64,
    pub min_delay: Option<f64>,
    pub max_delay: Option<f64>,
    /// Percent of lost echo requests.
    pub loss_rate: f64,
    pub jitter: f64,
    pub ping_success: bool,
    pub tcp: TcpSample,
    pub http: Option<HttpSample>,
    pub stability: Option<StabilitySample>,
    pub download: Option<DownloadSample>,
    /// Delay seen by the quick screen.
    pub quick_delay: Option<f64>,
    /// Present when several rounds were aggregated.
    pub rounds: Option<RoundSummary>,
}

impl TargetMetrics {
    /// Download throughput in MB/s, if measured.
    pub fn download_speed(&self) -> Option<f64> {
        self.download.as_ref().map(DownloadSample::speed_mbps)
    }
}

/// Per-metric aggregates over the deep-probe rounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundSummary {
    pub rounds: usize,
    pub avg_delay: AggregatedMetric,
    pub loss_rate: Option<AggregatedMetric>,
    pub jitter: Option<AggregatedMetric>,
    pub tcp_connect: Option<AggregatedMetric>,
    pub http_ttfb: Option<AggregatedMetric>,
    pub http_total: Option<AggregatedMetric>,
    /// 0-100; how consistent the delay was from round to round.
    pub consistency_score: u32,
}

/// Worst-case wall time of one deep probe.
pub fn deep_budget(config: &RunConfig) -> Duration {
    let mut round = ping_budget(config.ping_count, config.ping_timeout).saturating_add(config.tcp_timeout);
    if config.enable_http_test {
        round = round.saturating_add(config.http_timeout);
    }

    let mut budget = round.saturating_mul(config.effective_rounds());
    if config.enable_stability_test {
        budget = budget.saturating_add(config.tcp_timeout.saturating_mul(config.stability_attempts));
    }
    if config.enable_download_test {
        budget = budget.saturating_add(config.download_timeout);
    }
    budget
        .saturating_add(config.target_budget_buffer)
        .saturating_add(Duration::from_millis(MAX_START_JITTER_MS))
}

struct Round {
    ping: Option<PingSample>,
    tcp: TcpSample,
    http: Option<HttpSample>,
}

impl Round {
    fn metrics(&self) -> RoundMetrics {
        let http = self.http.as_ref().filter(|h| h.success);
        RoundMetrics {
            avg_delay: self.ping.as_ref().and_then(PingSample::avg_delay),
            loss_rate: self.ping.as_ref().and_then(|p| p.loss_rate),
            jitter: self.ping.as_ref().and_then(|p| p.jitter),
            tcp_connect_ms: self.tcp.connect_time_ms,
            http_ttfb_ms: http.and_then(|h| h.ttfb_ms),
            http_total_ms: http.and_then(|h| h.total_time_ms),
        }
    }
}

async fn probe_round(prober: &dyn Prober, target: &Target, port: u16, config: &RunConfig) -> Round {
    let host = target.host.as_str();

    let ping = match prober.ping(host, config.ping_count, config.ping_timeout).await {
        Ok(sample) => Some(sample),
        Err(e) => {
            tracing::debug!("Deep probe: ping {} failed: {}", target, e);
            None
        }
    };

    let tcp = match prober.tcp_connect(host, port, config.tcp_timeout).await {
        Ok(sample) => sample,
        Err(e) => TcpSample::failed(e.to_string()),
    };

    let http = if config.enable_http_test {
        Some(
            match prober
                .http_probe(host, port, &config.http_test_url, config.http_timeout)
                .await
            {
                Ok(sample) => sample,
                Err(e) => HttpSample::failed(e.to_string()),
            },
        )
    } else {
        None
    };

    Round { ping, tcp, http }
}

/// Combine a single round into target metrics.
fn from_single_round(round: Round) -> Result<TargetMetrics, String> {
    let ping = round.ping.filter(PingSample::is_success).ok_or("no ping reply")?;
    let avg_delay = ping.avg_delay().ok_or("no ping reply")?;

    Ok(TargetMetrics {
        avg_delay,
        min_delay: ping.min_delay(),
        max_delay: ping.max_delay(),
        loss_rate: ping.loss_rate.unwrap_or(100.0),
        jitter: ping.jitter.unwrap_or(0.0),
        ping_success: true,
        tcp: round.tcp,
        http: round.http,
        ..Default::default()
    })
}

/// Combine several rounds: every metric is aggregated on its own.
fn from_rounds(rounds: Vec<Round>, config: &RunConfig) -> Result<TargetMetrics, String> {
    let per_round: Vec<RoundMetrics> = rounds.iter().map(Round::metrics).collect();
    let aggregate = |metric| {
        stats::aggregate_rounds(
            &per_round,
            metric,
            config.outlier_filter_method,
            config.confidence_level,
        )
    };

    let avg_delay = aggregate(Metric::AvgDelay).map_err(|e| e.to_string())?;
    let loss_rate = aggregate(Metric::LossRate).ok();
    let jitter = aggregate(Metric::Jitter).ok();
    let tcp_connect = aggregate(Metric::TcpConnect).ok();
    let http_ttfb = aggregate(Metric::HttpTtfb).ok();
    let http_total = aggregate(Metric::HttpTotal).ok();

    let delays: Vec<f64> = rounds
        .iter()
        .filter_map(|r| r.ping.as_ref())
        .flat_map(|p| p.delays.iter().copied())
        .collect();

    // TCP counts as up only when most rounds connected.
    let connected = rounds.iter().filter(|r| r.tcp.success).count();
    let tcp = match &tcp_connect {
        Some(agg) if connected * 2 > rounds.len() => TcpSample::connected(agg.value),
        Some(agg) => TcpSample {
            connect_time_ms: Some(agg.value),
            success: false,
            failure_reason: Some(format!("connected in {}/{} rounds", connected, rounds.len())),
        },
        None => rounds
            .last()
            .map(|r| r.tcp.clone())
            .unwrap_or_else(|| TcpSample::failed("not measured")),
    };

    let http = match (&http_ttfb, &http_total) {
        (Some(ttfb), Some(total)) => {
            let status_code = rounds
                .iter()
                .filter_map(|r| r.http.as_ref())
                .find(|h| h.success)
                .and_then(|h| h.status_code);
            Some(HttpSample {
                ttfb_ms: Some(ttfb.value),
                total_time_ms: Some(total.value),
                status_code,
                success: true,
                failure_reason: None,
            })
        }
        _ => rounds.iter().rev().find_map(|r| r.http.clone()),
    };

    Ok(TargetMetrics {
        avg_delay: avg_delay.value,
        min_delay: delays.iter().copied().reduce(f64::min),
        max_delay: delays.iter().copied().reduce(f64::max),
        loss_rate: loss_rate.as_ref().map(|a| a.value).unwrap_or(100.0),
        jitter: jitter.as_ref().map(|a| a.value).unwrap_or(0.0),
        ping_success: true,
        tcp,
        http,
        rounds: Some(RoundSummary {
            rounds: rounds.len(),
            consistency_score: stats::stability_score_from_cv(avg_delay.cv),
            avg_delay,
            loss_rate,
            jitter,
            tcp_connect,
            http_ttfb,
            http_total,
        }),
        ..Default::default()
    })
}

/// Run the full probe set against one target.
pub async fn deep_probe(prober: &dyn Prober, target: &Target, config: &RunConfig) -> Result<TargetMetrics, String> {
    let port = target.port_or(config.default_port);

    let start_jitter = rand::thread_rng().gen_range(0..=MAX_START_JITTER_MS);
    tokio::time::sleep(Duration::from_millis(start_jitter)).await;

    let total_rounds = config.effective_rounds();
    let mut rounds = Vec::with_capacity(total_rounds as usize);
    for round in 1..=total_rounds {
        tracing::debug!("Deep probe: {} round {}/{}", target, round, total_rounds);
        rounds.push(probe_round(prober, target, port, config).await);
    }

    let mut metrics = if total_rounds > 1 {
        from_rounds(rounds, config)?
    } else {
        let round = rounds.pop().ok_or("no probe round ran")?;
        from_single_round(round)?
    };

    if config.enable_stability_test {
        let sample = prober
            .stability_probe(&target.host, port, config.stability_attempts, config.tcp_timeout)
            .await
            .unwrap_or_else(|e| {
                tracing::debug!("Deep probe: stability probe of {} failed: {}", target, e);
                StabilitySample {
                    attempts: config.stability_attempts,
                    ..Default::default()
                }
            });
        metrics.stability = Some(sample);
    }

    if config.enable_download_test {
        metrics.download = match prober
            .download_probe(
                &target.host,
                port,
                &config.download_url,
                config.download_duration,
                config.download_timeout,
            )
            .await
        {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::debug!("Deep probe: download through {} failed: {}", target, e);
                None
            }
        };
    }

    Ok(metrics)
}

fn deep_interrupted(i: Interruption) -> Result<TargetMetrics, String> {
    Err(i.to_string())
}

/// Run the deep probe over `targets`.
pub async fn run_deep_phase(
    prober: Arc<dyn Prober>,
    config: Arc<RunConfig>,
    targets: Vec<(usize, Target)>,
    cancel: &CancellationToken,
) -> Vec<PhaseResult<Result<TargetMetrics, String>>> {
    let workers = config.max_workers;
    let budget = deep_budget(&config);

    run_phase(
        "deep probe",
        targets,
        workers,
        budget,
        cancel,
        move |target| {
            let prober = prober.clone();
            let config = config.clone();
            async move { deep_probe(prober.as_ref(), &target, &config).await }
        },
        deep_interrupted,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{HostScript, ScriptedProber};
    use crate::targets::normalize;

    fn single_round() -> RunConfig {
        RunConfig {
            enable_multi_round: false,
            enable_stability_test: false,
            ..RunConfig::default()
        }
    }

    #[tokio::test]
    async fn test_single_round_metrics() {
        let prober = ScriptedProber::new().with_host("8.8.8.8", HostScript::healthy(&[10.0, 12.0, 11.0], 0.0));
        let metrics = deep_probe(&prober, &normalize("8.8.8.8").unwrap(), &single_round())
            .await
            .unwrap();

        assert_eq!(metrics.avg_delay, 11.0);
        assert_eq!(metrics.min_delay, Some(10.0));
        assert_eq!(metrics.max_delay, Some(12.0));
        assert_eq!(metrics.loss_rate, 0.0);
        assert!((metrics.jitter - 1.0).abs() < 1e-9);
        assert!(metrics.tcp.success);
        assert_eq!(metrics.http.as_ref().and_then(|h| h.ttfb_ms), Some(80.0));
        assert!(metrics.rounds.is_none());
        assert!(metrics.stability.is_none());
    }

    #[tokio::test]
    async fn test_multi_round_aggregates_each_metric() {
        let prober = ScriptedProber::new().with_host("1.1.1.1", HostScript::healthy(&[500.0, 520.0, 510.0], 20.0));
        let config = RunConfig {
            test_rounds: 3,
            enable_stability_test: true,
            stability_attempts: 5,
            ..RunConfig::default()
        };
        let metrics = deep_probe(&prober, &normalize("1.1.1.1").unwrap(), &config)
            .await
            .unwrap();

        let summary = metrics.rounds.as_ref().unwrap();
        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.avg_delay.original_count, 3);
        assert_eq!(summary.consistency_score, 100);
        assert_eq!(metrics.avg_delay, 510.0);
        assert_eq!(metrics.loss_rate, 20.0);
        assert_eq!(metrics.tcp.connect_time_ms, Some(20.0));
        assert_eq!(metrics.stability.as_ref().unwrap().successes, 5);
        assert_eq!(prober.ping_calls("1.1.1.1"), 3);
    }

    #[tokio::test]
    async fn test_multi_round_tcp_needs_majority() {
        let config = RunConfig {
            test_rounds: 3,
            enable_http_test: false,
            enable_stability_test: false,
            ..RunConfig::default()
        };

        let mut script = HostScript::healthy(&[40.0, 41.0], 0.0);
        script.fail_first_connects = 2;
        let prober = ScriptedProber::new().with_host("192.0.2.20", script);
        let metrics = deep_probe(&prober, &normalize("192.0.2.20").unwrap(), &config)
            .await
            .unwrap();
        assert!(!metrics.tcp.success);
        assert_eq!(metrics.tcp.connect_time_ms, Some(20.0));
        assert_eq!(metrics.tcp.failure_reason.as_deref(), Some("connected in 1/3 rounds"));

        let mut script = HostScript::healthy(&[40.0, 41.0], 0.0);
        script.fail_first_connects = 1;
        let prober = ScriptedProber::new().with_host("192.0.2.21", script);
        let metrics = deep_probe(&prober, &normalize("192.0.2.21").unwrap(), &config)
            .await
            .unwrap();
        assert!(metrics.tcp.success);
    }

    #[tokio::test]
    async fn test_no_delay_in_any_round_fails() {
        let prober = ScriptedProber::new().with_host("203.0.113.5", HostScript::dead());
        let config = RunConfig {
            enable_stability_test: false,
            ..RunConfig::default()
        };
        let result = deep_probe(&prober, &normalize("203.0.113.5").unwrap(), &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_download_probe_when_enabled() {
        let mut script = HostScript::healthy(&[30.0, 31.0], 0.0);
        script.download_mbps = Some(3.0);
        let prober = ScriptedProber::new().with_host("198.51.100.7", script);
        let config = RunConfig {
            enable_download_test: true,
            ..single_round()
        };

        let metrics = deep_probe(&prober, &normalize("198.51.100.7:8443").unwrap(), &config)
            .await
            .unwrap();
        assert!((metrics.download_speed().unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_deep_budget_covers_every_probe() {
        let config = RunConfig::default();
        // (10 x 2s + 9 x 0.2s + 5s + 10s) x 3 rounds + 10 x 5s stability + 5s buffer + jitter
        let expected = Duration::from_millis((36_800 * 3) + 50_000 + 5_000 + 100);
        assert_eq!(deep_budget(&config), expected);
    }
}
