use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HistoryError;
use crate::ranking::RankedEntry;

pub const SNAPSHOT_VERSION: u64 = 1;

/// Default snapshot location, relative to the working directory.
pub const DEFAULT_HISTORY_PATH: &str = "data/output/result_history.json";

/// One scored target as remembered by a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Normalized `host[:port]`.
    pub key: String,
    pub rank: usize,
    pub score: f64,
    pub delay: f64,
    #[serde(default)]
    pub original: String,
    #[serde(default)]
    pub loss_rate: Option<f64>,
    #[serde(default)]
    pub jitter: Option<f64>,
}

/// The ranked successful targets of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub total_count: usize,
    pub entries: Vec<HistoryEntry>,
}

impl HistorySnapshot {
    /// Snapshot the successful entries of a ranked run.
    pub fn from_ranked(ranked: &[RankedEntry], timestamp: DateTime<Utc>) -> Self {
        let entries = ranked
            .iter()
            .filter_map(|entry| {
                let metrics = entry.metrics()?;
                let scores = entry.scores()?;
                Some(HistoryEntry {
                    key: entry.target.key(),
                    rank: entry.rank,
                    score: scores.overall as f64,
                    delay: metrics.avg_delay,
                    original: entry.target.original.clone(),
                    loss_rate: Some(metrics.loss_rate),
                    jitter: Some(metrics.jitter),
                })
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            timestamp,
            total_count: ranked.len(),
            entries,
        }
    }

    /// Load a snapshot. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, HistoryError> {
        let display = path.display().to_string();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(HistoryError::Io { path: display, source }),
        };

        let malformed = |reason: String| HistoryError::Malformed {
            path: display.clone(),
            reason,
        };

        let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| malformed(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| malformed("missing version".to_string()))?;
        if version != SNAPSHOT_VERSION {
            return Err(HistoryError::Incompatible { found: version });
        }

        let snapshot: Self = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
        Ok(Some(snapshot))
    }

    /// Write the snapshot via a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| HistoryError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;

        tracing::info!("History: saved {} entries to {}", self.entries.len(), path.display());
        Ok(())
    }
}
