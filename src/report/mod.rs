//! Report output.
//!
//! Writes the ranked run as Markdown, JSON and a plain best-targets list,
//! and prints a short summary to stdout.

mod markdown;

pub use markdown::*;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::history::DiffReport;
use crate::ranking::{RankedEntry, SortBy, Tier};
use crate::scoring::{ScoreSet, ScoringMode};

/// Report error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render report: {0}")]
    Render(#[from] askama::Error),
    #[error("failed to encode results: {0}")]
    Json(#[from] serde_json::Error),
}

/// One output record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub rank: usize,
    pub original: String,
    pub key: String,
    pub location: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub tier: Option<Tier>,
    pub avg_delay: Option<f64>,
    pub loss_rate: Option<f64>,
    pub jitter: Option<f64>,
    pub tcp_connect_ms: Option<f64>,
    pub http_ttfb_ms: Option<f64>,
    /// MB/s.
    pub download_speed: Option<f64>,
    pub consistency_score: Option<u32>,
    pub score: Option<u32>,
    pub scores: Option<ScoreSet>,
}

impl ReportRow {
    pub fn from_entry(entry: &RankedEntry) -> Self {
        let metrics = entry.metrics();
        Self {
            rank: entry.rank,
            original: entry.target.original.clone(),
            key: entry.target.key(),
            location: entry.target.location_tag().map(str::to_string),
            success: entry.is_success(),
            failure_reason: entry.failure_reason().map(str::to_string),
            tier: entry.tier(),
            avg_delay: metrics.map(|m| m.avg_delay),
            loss_rate: metrics.map(|m| m.loss_rate),
            jitter: metrics.map(|m| m.jitter),
            tcp_connect_ms: metrics.and_then(|m| m.tcp.connect_time_ms),
            http_ttfb_ms: metrics
                .and_then(|m| m.http.as_ref())
                .filter(|h| h.success)
                .and_then(|h| h.ttfb_ms),
            download_speed: metrics.and_then(|m| m.download_speed()),
            consistency_score: metrics.and_then(|m| m.rounds.as_ref()).map(|r| r.consistency_score),
            score: entry.scores().map(|s| s.overall),
            scores: entry.scores().copied(),
        }
    }
}

/// Facts about the run shown at the top of every report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub generated_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub rounds: u32,
    pub scoring_mode: ScoringMode,
    pub sort_by: SortBy,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    summary: &'a RunSummary,
    results: Vec<ReportRow>,
    diff: Option<&'a DiffReport>,
}

/// Lines of the best-targets export: `host[:port]#label`, best first.
pub fn best_targets(ranked: &[RankedEntry], max_results: usize) -> Vec<String> {
    ranked
        .iter()
        .filter(|e| e.is_success())
        .take(max_results)
        .map(|e| {
            let label = e.target.location_tag().unwrap_or(&e.target.host);
            format!("{}#{}", e.target.key(), label)
        })
        .collect()
}

/// Files written by [`write_reports`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReportFiles {
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub best: PathBuf,
}

fn write_file(path: &Path, contents: &str) -> Result<(), ReportError> {
    std::fs::write(path, contents).map_err(|source| ReportError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Write `result.md`, `result.json` and `best.txt` into `dir`.
pub fn write_reports(
    dir: &Path,
    ranked: &[RankedEntry],
    summary: &RunSummary,
    diff: Option<&DiffReport>,
    max_results: usize,
) -> Result<ReportFiles, ReportError> {
    std::fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let files = ReportFiles {
        markdown: dir.join("result.md"),
        json: dir.join("result.json"),
        best: dir.join("best.txt"),
    };

    write_file(&files.markdown, &render_markdown(ranked, summary, diff)?)?;

    let json = JsonReport {
        summary,
        results: ranked.iter().map(ReportRow::from_entry).collect(),
        diff,
    };
    write_file(&files.json, &serde_json::to_string_pretty(&json)?)?;

    let mut best = best_targets(ranked, max_results).join("\n");
    if !best.is_empty() {
        best.push('\n');
    }
    write_file(&files.best, &best)?;

    tracing::info!("Report: wrote {} entries to {}", ranked.len(), dir.display());
    Ok(files)
}

fn fmt_ms(value: Option<f64>) -> String {
    value.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".to_string())
}

/// Print the top entries and the diff verdict to stdout.
pub fn print_summary(ranked: &[RankedEntry], summary: &RunSummary, diff: Option<&DiffReport>, top: usize) {
    println!();
    println!(
        "{} targets: {} scored, {} failed ({:.1}s)",
        summary.total, summary.succeeded, summary.failed, summary.elapsed_secs
    );
    println!();
    println!(
        "{:<5} {:<32} {:>10} {:>8} {:>10} {:>6} {:<10}",
        "Rank", "Target", "Delay", "Loss%", "Jitter", "Score", "Tier"
    );
    for entry in ranked.iter().filter(|e| e.is_success()).take(top) {
        let row = ReportRow::from_entry(entry);
        println!(
            "{:<5} {:<32} {:>10} {:>8} {:>10} {:>6} {:<10}",
            row.rank,
            row.original,
            fmt_ms(row.avg_delay),
            fmt_ms(row.loss_rate),
            fmt_ms(row.jitter),
            row.score.map(|s| s.to_string()).unwrap_or_default(),
            row.tier.map(|t| t.to_string()).unwrap_or_default(),
        );
    }

    if let Some(diff) = diff {
        println!();
        println!(
            "Since {}: {} new, {} removed, {} rank changes, {} score changes, trend {:+.1}",
            diff.history_timestamp,
            diff.new.len(),
            diff.removed.len(),
            diff.rank_changes.len(),
            diff.score_changes.len(),
            diff.trend
        );
        println!("Recommendation: {} ({})", diff.recommendation, diff.recommendation.describe());
    }
}
