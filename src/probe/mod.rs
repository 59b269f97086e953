//! Probe module for endpoint measurements.
//!
//! Supports ping, TCP connect, HTTP timing, connection stability and
//! download throughput probes behind the [`Prober`] trait.

mod http;
mod ping;
mod tcp;

#[cfg(test)]
pub mod testing;

pub use http::*;
pub use ping::*;
pub use tcp::*;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::stats;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("unparseable probe output: {0}")]
    Parse(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("probe cancelled")]
    Cancelled,
}

/// Result of one ping run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PingSample {
    /// Round-trip times in milliseconds, in reply order.
    pub delays: Vec<f64>,
    pub sent: u32,
    /// Percent of echo requests without a reply.
    pub loss_rate: Option<f64>,
    /// Standard deviation of `delays` in milliseconds.
    pub jitter: Option<f64>,
}

impl PingSample {
    /// Build a sample from the collected replies of `sent` echo requests.
    pub fn from_delays(delays: Vec<f64>, sent: u32) -> Self {
        let loss_rate = (sent > 0).then(|| {
            let lost = sent.saturating_sub(delays.len() as u32);
            lost as f64 / sent as f64 * 100.0
        });
        let jitter = match delays.len() {
            0 => None,
            1 => Some(0.0),
            _ => stats::stdev(&delays),
        };
        Self {
            delays,
            sent,
            loss_rate,
            jitter,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.delays.is_empty()
    }

    pub fn avg_delay(&self) -> Option<f64> {
        stats::mean(&self.delays)
    }

    pub fn min_delay(&self) -> Option<f64> {
        self.delays.iter().copied().reduce(f64::min)
    }

    pub fn max_delay(&self) -> Option<f64> {
        self.delays.iter().copied().reduce(f64::max)
    }
}

/// Result of a single TCP connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TcpSample {
    pub connect_time_ms: Option<f64>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

impl TcpSample {
    pub fn connected(connect_time_ms: f64) -> Self {
        Self {
            connect_time_ms: Some(connect_time_ms),
            success: true,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            connect_time_ms: None,
            success: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Result of an HTTP request routed through the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpSample {
    /// Time until response headers arrived.
    pub ttfb_ms: Option<f64>,
    /// Time until the body was fully read.
    pub total_time_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

impl HttpSample {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Result of repeated TCP connects against the same target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StabilitySample {
    pub attempts: u32,
    pub successes: u32,
    pub connect_times: Vec<f64>,
}

impl StabilitySample {
    /// Percent of attempts that connected.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64 * 100.0
    }

    /// Connection stability in `[0, 100]`: success rate, less a penalty
    /// for a high coefficient of variation of connect times.
    pub fn score(&self) -> u32 {
        let rate = self.success_rate();
        let mut score = if rate >= 90.0 {
            90.0 + (rate - 90.0)
        } else if rate >= 80.0 {
            70.0 + (rate - 80.0) * 2.0
        } else if rate >= 70.0 {
            50.0 + (rate - 70.0) * 2.0
        } else {
            rate * 0.7
        };

        if self.connect_times.len() > 1 {
            let cv = stats::coefficient_of_variation(&self.connect_times);
            score -= if cv < 10.0 {
                0.0
            } else if cv < 20.0 {
                5.0
            } else if cv < 30.0 {
                10.0
            } else {
                15.0
            };
        }

        score.clamp(0.0, 100.0) as u32
    }
}

/// Result of a bounded-duration download through the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadSample {
    pub bytes: u64,
    pub elapsed_ms: f64,
    pub status_code: Option<u16>,
}

impl DownloadSample {
    /// Throughput in megabytes per second.
    pub fn speed_mbps(&self) -> f64 {
        if self.elapsed_ms <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / 1_000_000.0 / (self.elapsed_ms / 1000.0)
    }
}

/// A probe executor. Every operation is bounded by its own timeout.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn ping(&self, host: &str, count: u32, timeout: Duration) -> Result<PingSample, ProbeError>;

    async fn tcp_connect(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpSample, ProbeError>;

    async fn http_probe(
        &self,
        host: &str,
        port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<HttpSample, ProbeError>;

    async fn stability_probe(
        &self,
        host: &str,
        port: u16,
        attempts: u32,
        timeout: Duration,
    ) -> Result<StabilitySample, ProbeError>;

    async fn download_probe(
        &self,
        host: &str,
        port: u16,
        url: &str,
        duration: Duration,
        timeout: Duration,
    ) -> Result<DownloadSample, ProbeError>;
}

/// Probe executor backed by the real network.
#[derive(Debug, Clone, Default)]
pub struct NetworkProber;

impl NetworkProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn ping(&self, host: &str, count: u32, timeout: Duration) -> Result<PingSample, ProbeError> {
        run_ping_probe(host, count, timeout).await
    }

    async fn tcp_connect(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpSample, ProbeError> {
        let ip = resolve_address(host).await?;
        let elapsed = run_tcp_connect(ip, port, timeout).await?;
        Ok(TcpSample::connected(elapsed))
    }

    async fn http_probe(
        &self,
        host: &str,
        port: u16,
        url: &str,
        timeout: Duration,
    ) -> Result<HttpSample, ProbeError> {
        let ip = resolve_address(host).await?;
        run_http_probe(ip, port, url, timeout).await
    }

    async fn stability_probe(
        &self,
        host: &str,
        port: u16,
        attempts: u32,
        timeout: Duration,
    ) -> Result<StabilitySample, ProbeError> {
        let ip = resolve_address(host).await?;
        Ok(run_stability_probe(ip, port, attempts, timeout).await)
    }

    async fn download_probe(
        &self,
        host: &str,
        port: u16,
        url: &str,
        duration: Duration,
        timeout: Duration,
    ) -> Result<DownloadSample, ProbeError> {
        let ip = resolve_address(host).await?;
        run_download_probe(ip, port, url, duration, timeout).await
    }
}

/// Resolve a hostname or IP literal to an address.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    let literal = address.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Unreachable(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Unreachable(format!("no addresses found for {}", address)))
}
