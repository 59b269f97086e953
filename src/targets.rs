//! Target registry.
//!
//! Turns raw input lines of the form `host[:port][#tag]` into [`Target`]
//! descriptors and deduplicates them by identity key.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Target registry error types.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("empty target line")]
    Empty,
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("no targets to test")]
    NoTargets,
}

/// A single candidate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    /// The input line as given, trimmed.
    pub original: String,
    pub host: String,
    pub port: Option<u16>,
    /// Text after `#`, if any.
    pub tag: Option<String>,
}

impl Target {
    /// Identity key used for deduplication and history: `host[:port]`.
    pub fn key(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Region label carried in the trailing tag, e.g. `SG` for `#SG-edge-3`.
    pub fn location_tag(&self) -> Option<&str> {
        let tag = self.tag.as_deref()?;
        let candidate = tag.split('-').next().unwrap_or_default().trim();
        if candidate.is_empty() {
            return None;
        }
        // Promotional labels copied from shared lists.
        if ["@", "频道", "加入"].iter().any(|t| candidate.contains(t)) {
            return None;
        }
        Some(candidate)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Parse one raw line into a [`Target`].
///
/// The trailing `#comment` becomes the tag. A `:port` suffix is split off
/// only when the remainder has exactly one colon and the part after it is
/// all digits, so IPv6 literals are never split.
pub fn normalize(line: &str) -> Result<Target, TargetError> {
    let original = line.trim();
    let (address, tag) = match original.split_once('#') {
        Some((address, tag)) => {
            let tag = tag.trim();
            (address.trim(), (!tag.is_empty()).then(|| tag.to_string()))
        }
        None => (original, None),
    };

    if address.is_empty() {
        return Err(TargetError::Empty);
    }

    let (host, port) = match address.split_once(':') {
        Some((host, port))
            if address.matches(':').count() == 1
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            let port: u16 = port
                .parse()
                .map_err(|_| TargetError::InvalidPort(original.to_string()))?;
            (host.trim(), Some(port))
        }
        _ => (address, None),
    };

    if host.is_empty() {
        return Err(TargetError::Empty);
    }

    Ok(Target {
        original: original.to_string(),
        host: host.to_string(),
        port,
        tag,
    })
}

/// Result of loading raw lines into the registry.
#[derive(Debug, Default)]
pub struct LoadedTargets {
    /// Unique targets in first-seen order.
    pub targets: Vec<Target>,
    pub duplicates: usize,
    pub invalid: usize,
}

impl LoadedTargets {
    /// The target list, or [`TargetError::NoTargets`] when nothing usable was loaded.
    pub fn into_targets(self) -> Result<Vec<Target>, TargetError> {
        if self.targets.is_empty() {
            return Err(TargetError::NoTargets);
        }
        Ok(self.targets)
    }
}

/// Normalize and deduplicate raw lines, preserving first-seen order.
pub fn load<I, S>(lines: I) -> LoadedTargets
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut loaded = LoadedTargets::default();
    let mut seen = HashSet::new();

    for line in lines {
        let line = line.as_ref();
        let target = match normalize(line) {
            Ok(t) => t,
            Err(TargetError::Empty) => continue,
            Err(e) => {
                tracing::warn!("Registry: skipping {:?}: {}", line.trim(), e);
                loaded.invalid += 1;
                continue;
            }
        };

        if seen.insert(target.key()) {
            loaded.targets.push(target);
        } else {
            loaded.duplicates += 1;
        }
    }

    if loaded.duplicates > 0 {
        tracing::info!(
            "Registry: dropped {} duplicate targets, {} remain",
            loaded.duplicates,
            loaded.targets.len()
        );
    }

    loaded
}

/// Keep the target lines of a raw list: blank lines and `#` comment lines are dropped.
pub fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Read target lines from a local file.
pub async fn read_target_file(path: &Path) -> Result<Vec<String>, TargetError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| TargetError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_list(&String::from_utf8_lossy(&bytes)))
}

/// Download a plain-text target list.
pub async fn fetch_target_url(
    client: &reqwest::Client,
    url: &str,
    retries: u32,
) -> Result<Vec<String>, TargetError> {
    let mut last_error = String::new();

    for attempt in 0..=retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let response = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                last_error = e.to_string();
                tracing::debug!("Registry: fetch {} attempt {} failed: {}", url, attempt + 1, e);
                continue;
            }
        };

        if !response.status().is_success() {
            last_error = format!("HTTP {}", response.status());
            continue;
        }

        match response.text().await {
            Ok(body) => return Ok(parse_list(&body)),
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(TargetError::Fetch {
        url: url.to_string(),
        reason: last_error,
    })
}

/// Fetch every URL in order, skipping sources that fail.
pub async fn fetch_target_urls(urls: &[String], timeout: Duration, retries: u32) -> Vec<String> {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Registry: failed to build HTTP client: {}", e);
            return Vec::new();
        }
    };

    let mut lines = Vec::new();
    for url in urls {
        match fetch_target_url(&client, url, retries).await {
            Ok(fetched) => {
                tracing::info!("Registry: fetched {} lines from {}", fetched.len(), url);
                lines.extend(fetched);
            }
            Err(e) => tracing::warn!("Registry: {}", e),
        }
    }
    lines
}
