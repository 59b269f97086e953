//! TCP connect and connection stability probes.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::{ProbeError, StabilitySample};

/// Open and close one TCP connection. Returns the connect time in milliseconds.
pub async fn run_tcp_connect(ip: IpAddr, port: u16, timeout: Duration) -> Result<f64, ProbeError> {
    let addr = SocketAddr::new(ip, port);
    let start = Instant::now();

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            std::io::ErrorKind::ConnectionRefused => {
                ProbeError::Unreachable(format!("connection refused by {}", addr))
            }
            _ => ProbeError::Unreachable(format!("connect to {} failed: {}", addr, e)),
        })?;

    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
    drop(stream);
    Ok(elapsed)
}

/// Connect `attempts` times in a row and record how many succeed.
pub async fn run_stability_probe(ip: IpAddr, port: u16, attempts: u32, timeout: Duration) -> StabilitySample {
    let mut sample = StabilitySample {
        attempts,
        ..Default::default()
    };

    for _ in 0..attempts {
        match run_tcp_connect(ip, port, timeout).await {
            Ok(ms) => {
                sample.successes += 1;
                sample.connect_times.push(ms);
            }
            Err(e) => tracing::debug!("Stability probe: {}:{} attempt failed: {}", ip, port, e),
        }
    }

    sample
}
