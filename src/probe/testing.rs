//! Scripted probe executor for scheduler and pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{DownloadSample, HttpSample, PingSample, ProbeError, Prober, StabilitySample, TcpSample};

/// Canned behaviour for one host.
#[derive(Debug, Clone)]
pub struct HostScript {
    /// Delays returned by deep pings (count > quick count).
    pub delays: Vec<f64>,
    pub loss_rate: f64,
    pub tcp: Result<f64, ProbeError>,
    pub http_ttfb: Option<f64>,
    pub stability_successes: Option<u32>,
    pub download_mbps: Option<f64>,
    /// Number of leading ping calls that fail before the script applies.
    pub fail_first_pings: u32,
    /// Number of leading TCP connects that are refused.
    pub fail_first_connects: u32,
    /// Delay before every ping answers.
    pub ping_latency: Duration,
    pub panic_on_ping: bool,
}

impl HostScript {
    pub fn healthy(delays: &[f64], loss_rate: f64) -> Self {
        Self {
            delays: delays.to_vec(),
            loss_rate,
            tcp: Ok(20.0),
            http_ttfb: Some(80.0),
            stability_successes: None,
            download_mbps: None,
            fail_first_pings: 0,
            fail_first_connects: 0,
            ping_latency: Duration::ZERO,
            panic_on_ping: false,
        }
    }

    pub fn dead() -> Self {
        Self {
            delays: Vec::new(),
            loss_rate: 100.0,
            tcp: Err(ProbeError::Unreachable("connection refused".into())),
            ..Self::healthy(&[], 100.0)
        }
    }
}

/// In-memory [`Prober`] answering from per-host scripts.
#[derive(Debug, Default)]
pub struct ScriptedProber {
    scripts: HashMap<String, HostScript>,
    ping_calls: Mutex<HashMap<String, u32>>,
    connect_calls: Mutex<HashMap<String, u32>>,
    total_pings: AtomicU32,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, script: HostScript) -> Self {
        self.scripts.insert(host.to_string(), script);
        self
    }

    pub fn ping_calls(&self, host: &str) -> u32 {
        self.ping_calls
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_pings(&self) -> u32 {
        self.total_pings.load(Ordering::SeqCst)
    }

    fn script(&self, host: &str) -> Result<&HostScript, ProbeError> {
        self.scripts
            .get(host)
            .ok_or_else(|| ProbeError::Unreachable(format!("unknown host {}", host)))
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn ping(&self, host: &str, count: u32, _timeout: Duration) -> Result<PingSample, ProbeError> {
        self.total_pings.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut calls = self.ping_calls.lock().unwrap();
            let n = calls.entry(host.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        let script = self.script(host)?;
        if script.panic_on_ping {
            panic!("scripted panic for {}", host);
        }
        if !script.ping_latency.is_zero() {
            tokio::time::sleep(script.ping_latency).await;
        }
        if call <= script.fail_first_pings {
            return Err(ProbeError::Timeout(Duration::from_secs(1)));
        }

        let delays: Vec<f64> = script.delays.iter().copied().take(count as usize).collect();
        let mut sample = PingSample::from_delays(delays, count);
        if sample.is_success() {
            sample.loss_rate = Some(script.loss_rate);
        }
        Ok(sample)
    }

    async fn tcp_connect(&self, host: &str, _port: u16, _timeout: Duration) -> Result<TcpSample, ProbeError> {
        let call = {
            let mut calls = self.connect_calls.lock().unwrap();
            let n = calls.entry(host.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        let script = self.script(host)?;
        if call <= script.fail_first_connects {
            return Err(ProbeError::Unreachable("connection refused".into()));
        }
        let ms = script.tcp.clone()?;
        Ok(TcpSample::connected(ms))
    }

    async fn http_probe(
        &self,
        host: &str,
        _port: u16,
        _url: &str,
        _timeout: Duration,
    ) -> Result<HttpSample, ProbeError> {
        match self.script(host)?.http_ttfb {
            Some(ttfb) => Ok(HttpSample {
                ttfb_ms: Some(ttfb),
                total_time_ms: Some(ttfb + 10.0),
                status_code: Some(204),
                success: true,
                failure_reason: None,
            }),
            None => Err(ProbeError::Timeout(Duration::from_secs(1))),
        }
    }

    async fn stability_probe(
        &self,
        host: &str,
        _port: u16,
        attempts: u32,
        _timeout: Duration,
    ) -> Result<StabilitySample, ProbeError> {
        let successes = self.script(host)?.stability_successes.unwrap_or(attempts).min(attempts);
        Ok(StabilitySample {
            attempts,
            successes,
            connect_times: vec![20.0; successes as usize],
        })
    }

    async fn download_probe(
        &self,
        host: &str,
        _port: u16,
        _url: &str,
        _duration: Duration,
        _timeout: Duration,
    ) -> Result<DownloadSample, ProbeError> {
        match self.script(host)?.download_mbps {
            Some(mbps) => Ok(DownloadSample {
                bytes: (mbps * 1_000_000.0) as u64,
                elapsed_ms: 1000.0,
                status_code: Some(200),
            }),
            None => Err(ProbeError::Unreachable("no download".into())),
        }
    }
}
