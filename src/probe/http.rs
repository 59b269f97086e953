//! HTTP timing and download probes.
//!
//! Requests are routed through the probed address while TLS SNI and the
//! `Host` header keep the URL's host name, so the result reflects reaching
//! the site via that edge node.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::{DownloadSample, HttpSample, ProbeError};

/// Body bytes read by the timing probe; the rest of a large page is skipped.
const HTTP_BODY_LIMIT: usize = 16 * 1024;

/// Build a client whose DNS for the URL host is pinned to `ip:port`.
fn pinned_client(
    url: &str,
    ip: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<(reqwest::Client, reqwest::Url), ProbeError> {
    let mut parsed =
        reqwest::Url::parse(url).map_err(|e| ProbeError::Parse(format!("invalid URL {}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ProbeError::Parse(format!("URL without host: {}", url)))?
        .to_string();

    // The pinned address only replaces DNS; the port must be in the URL.
    if parsed.port_or_known_default() != Some(port) {
        parsed
            .set_port(Some(port))
            .map_err(|_| ProbeError::Parse(format!("cannot set port on {}", url)))?;
    }

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .resolve(&host, SocketAddr::new(ip, port))
        .build()
        .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

    Ok((client, parsed))
}

fn map_request_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Unreachable(e.to_string())
    }
}

/// Time an HTTP GET of `url` through `ip:port`.
///
/// Any HTTP response counts as success; the status code is recorded.
pub async fn run_http_probe(ip: IpAddr, port: u16, url: &str, timeout: Duration) -> Result<HttpSample, ProbeError> {
    let (client, url) = pinned_client(url, ip, port, timeout)?;

    let start = Instant::now();

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| map_request_error(e, timeout))?;

    let ttfb = start.elapsed();
    let status = response.status().as_u16();

    let mut read = 0;
    while read < HTTP_BODY_LIMIT {
        match response.chunk().await.map_err(|e| map_request_error(e, timeout))? {
            Some(chunk) => read += chunk.len(),
            None => break,
        }
    }

    Ok(HttpSample {
        ttfb_ms: Some(ttfb.as_secs_f64() * 1000.0),
        total_time_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
        status_code: Some(status),
        success: true,
        failure_reason: None,
    })
}

/// Download from `url` through `ip:port` for at most `duration`.
pub async fn run_download_probe(
    ip: IpAddr,
    port: u16,
    url: &str,
    duration: Duration,
    timeout: Duration,
) -> Result<DownloadSample, ProbeError> {
    let (client, url) = pinned_client(url, ip, port, timeout)?;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| map_request_error(e, timeout))?;

    let status = response.status().as_u16();
    if status != 200 && status != 206 {
        return Err(ProbeError::Unreachable(format!("download returned HTTP {}", status)));
    }

    let start = Instant::now();
    let mut bytes: u64 = 0;

    loop {
        let Some(remaining) = duration.checked_sub(start.elapsed()) else {
            break;
        };
        match tokio::time::timeout(remaining, response.chunk()).await {
            Ok(Ok(Some(chunk))) => bytes += chunk.len() as u64,
            Ok(Ok(None)) | Err(_) => break,
            Ok(Err(e)) if bytes == 0 => return Err(map_request_error(e, timeout)),
            Ok(Err(e)) => {
                tracing::debug!("Download probe: stream for {} ended early: {}", ip, e);
                break;
            }
        }
    }

    Ok(DownloadSample {
        bytes,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        status_code: Some(status),
    })
}
