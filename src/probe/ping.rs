//! ICMP echo runs for the delay, loss and jitter metrics.
//!
//! Echoes go out on a blocking socket inside `spawn_blocking`; hosts
//! without ICMP socket access shell out to the system `ping`.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{resolve_address, PingSample, ProbeError};

/// Pause between consecutive echo requests of one run.
pub const PING_INTERVAL: Duration = Duration::from_millis(200);

/// Extra wall time granted to the ping command beyond its per-reply timeouts.
const COMMAND_BUFFER: Duration = Duration::from_secs(5);

/// How this process can send echo requests.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// RAW or DGRAM ICMP socket
    Native,
    /// System `ping` binary
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each echo request so concurrent pings,
/// even to the same destination, can be told apart.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Probe once for a usable ICMP socket type.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, and on macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Longest a run of `count` echoes can take: every reply timing out, plus
/// the pauses between requests.
pub fn ping_budget(count: u32, timeout: Duration) -> Duration {
    timeout
        .saturating_mul(count)
        .saturating_add(PING_INTERVAL.saturating_mul(count.saturating_sub(1)))
}

/// Send `count` echo requests to `address`, each waiting up to `timeout`.
///
/// A run without any reply is not an error: it yields an empty sample
/// with 100% loss.
pub async fn run_ping_probe(address: &str, count: u32, timeout: Duration) -> Result<PingSample, ProbeError> {
    let count = count.max(1);
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve before spawn_blocking (DNS is async)
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, count, timeout))
            .await
            .map_err(|e| ProbeError::Unreachable(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(delays) => return Ok(PingSample::from_delays(delays, count)),
            Err(ProbeError::Command(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
            }
            Err(e) => return Err(e),
        }
    }

    run_ping_command(address, count, timeout).await
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Run `count` blocking ICMP echoes with precise timing.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, count: u32, timeout: Duration) -> Result<Vec<f64>, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // RAW first (privileged), then DGRAM (unprivileged)
    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Command(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Command(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Unreachable(format!("Failed to connect: {}", e)))?;

    let mut delays = Vec::with_capacity(count as usize);
    for i in 0..count {
        if i > 0 {
            std::thread::sleep(PING_INTERVAL);
        }
        if let Some(ms) = echo_once(&socket, ip.is_ipv6(), timeout)? {
            delays.push(ms);
        }
    }

    Ok(delays)
}

/// One echo round trip. `Ok(None)` means no matching reply before the timeout.
fn echo_once(socket: &Socket, v6: bool, timeout: Duration) -> Result<Option<f64>, ProbeError> {
    let (identifier, sequence) = generate_ping_id();
    let packet = if v6 {
        build_icmpv6_echo_request(identifier, sequence)
    } else {
        build_icmp_echo_request(identifier, sequence)
    };

    // Start timing just before send
    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Command(format!("Permission denied: {}", e))
        } else {
            ProbeError::Unreachable(format!("Failed to send: {}", e))
        }
    })?;

    // Loop until we get OUR reply or time out
    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return Ok(None),
        };
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Command(format!("Failed to set timeout: {}", e)))?;

        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => return Err(ProbeError::Unreachable(format!("Failed to receive: {}", e))),
        };
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(None);
        }

        if is_matching_reply(buf, v6, identifier, sequence) {
            return Ok(Some(elapsed.as_secs_f64() * 1000.0));
        }
        // Someone else's packet, keep waiting
    }
}

/// Check that `buf` is the echo reply for (`identifier`, `sequence`).
///
/// DGRAM sockets deliver only the ICMP message; RAW IPv4 sockets include
/// the 20-byte IP header in front of it.
fn is_matching_reply(buf: &[u8], v6: bool, identifier: u16, sequence: u16) -> bool {
    let (offset, reply_type) = if v6 {
        (0, 129) // ICMPv6 Echo Reply
    } else {
        let offset = if buf.first().map(|b| b >> 4) == Some(4) { 20 } else { 0 };
        (offset, 0) // ICMP Echo Reply
    };

    if buf.len() < offset + 8 {
        return false;
    }

    let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
    let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);
    buf[offset] == reply_type && reply_id == identifier && reply_seq == sequence
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = echo_payload(8, identifier, sequence);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    echo_payload(128, identifier, sequence)
}

fn echo_payload(kind: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = kind;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    packet
}

/// Internet checksum, RFC 1071.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run the system `ping` for hosts without ICMP socket access.
async fn run_ping_command(address: &str, count: u32, timeout: Duration) -> Result<PingSample, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);
    let budget = Duration::from_secs(timeout_secs) * count + COMMAND_BUFFER;

    let child = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-W",
            &timeout_secs.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(budget, child)
        .await
        .map_err(|_| ProbeError::Timeout(budget))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    // Exit code 1 means some or all replies were lost; anything else
    // non-zero is a resolution or usage error.
    if !output.status.success() && output.status.code() != Some(1) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Unreachable(format!(
            "ping failed: {}",
            stderr.trim()
        )));
    }

    parse_ping_output(&stdout, count)
}

/// Parse ping command output into a sample.
///
/// Every per-reply `time=X ms` line becomes one delay sample; the
/// transmitted count comes from the summary when present.
fn parse_ping_output(output: &str, requested: u32) -> Result<PingSample, ProbeError> {
    static RE_TIME: OnceLock<Regex> = OnceLock::new();
    let re_time = RE_TIME.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    static RE_SENT: OnceLock<Regex> = OnceLock::new();
    let re_sent = RE_SENT.get_or_init(|| Regex::new(r"(?P<sent>\d+) packets transmitted").unwrap());

    static RE_LOSS: OnceLock<Regex> = OnceLock::new();
    let re_loss = RE_LOSS.get_or_init(|| Regex::new(r"(?P<loss>[0-9.]+)% packet loss").unwrap());

    let delays: Vec<f64> = re_time
        .captures_iter(output)
        .filter_map(|caps| caps.name("val")?.as_str().parse::<f64>().ok())
        .collect();

    let sent = re_sent
        .captures(output)
        .and_then(|caps| caps.name("sent")?.as_str().parse::<u32>().ok())
        .unwrap_or(requested);

    if delays.is_empty() && !re_loss.is_match(output) {
        return Err(ProbeError::Parse(format!(
            "failed to parse ping output: {}",
            output
        )));
    }

    Ok(PingSample::from_delays(delays, sent.max(1)))
}
