use askama::Template;

use super::{ReportError, ReportRow, RunSummary};
use crate::history::DiffReport;
use crate::ranking::{tier_counts, RankedEntry};

/// Changes listed per section of the history diff.
const DIFF_LINES: usize = 10;

#[derive(Template)]
#[template(path = "report.md", escape = "none")]
struct MarkdownReport {
    generated_at: String,
    elapsed: String,
    total: usize,
    succeeded: usize,
    failed: usize,
    duplicates: usize,
    invalid: usize,
    settings: String,
    ordering: String,
    tiers: Vec<String>,
    rows: Vec<String>,
    failures: Vec<String>,
    has_history: bool,
    history_time: String,
    recommendation: String,
    trend: String,
    history_lines: Vec<String>,
}

fn cell(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}

/// Pipes would split a table cell.
fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

fn table_row(row: &ReportRow) -> String {
    let scores = row.scores.unwrap_or_default();
    format!(
        "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |",
        row.rank,
        escape_cell(&row.original),
        row.location.as_deref().map(escape_cell).unwrap_or_else(|| "-".to_string()),
        cell(row.avg_delay, 1),
        cell(row.loss_rate, 1),
        cell(row.jitter, 1),
        cell(row.tcp_connect_ms, 1),
        cell(row.download_speed, 2),
        row.score.unwrap_or(0),
        scores.availability,
        scores.speed,
        scores.stability,
        scores.responsiveness,
        row.tier.map(|t| t.to_string()).unwrap_or_default(),
    )
}

fn history_lines(diff: &DiffReport) -> Vec<String> {
    let mut lines = Vec::new();

    if !diff.new.is_empty() {
        lines.push(format!("### New ({})", diff.new.len()));
        lines.push(String::new());
        lines.extend(
            diff.new
                .iter()
                .take(DIFF_LINES)
                .map(|e| format!("- #{} `{}` score {:.0}", e.rank, e.key, e.score)),
        );
        lines.push(String::new());
    }

    if !diff.removed.is_empty() {
        lines.push(format!("### Removed ({})", diff.removed.len()));
        lines.push(String::new());
        lines.extend(
            diff.removed
                .iter()
                .take(DIFF_LINES)
                .map(|e| format!("- was #{} `{}` score {:.0}", e.rank, e.key, e.score)),
        );
        lines.push(String::new());
    }

    if !diff.rank_changes.is_empty() {
        lines.push(format!("### Rank changes ({})", diff.rank_changes.len()));
        lines.push(String::new());
        lines.extend(diff.rank_changes.iter().take(DIFF_LINES).map(|c| {
            let arrow = if c.rank_diff > 0 { "up" } else { "down" };
            format!(
                "- `{}` #{} -> #{} ({} {})",
                c.key,
                c.old_rank,
                c.new_rank,
                arrow,
                c.rank_diff.abs()
            )
        }));
        lines.push(String::new());
    }

    if !diff.score_changes.is_empty() {
        lines.push(format!("### Score changes ({})", diff.score_changes.len()));
        lines.push(String::new());
        lines.extend(diff.score_changes.iter().take(DIFF_LINES).map(|c| {
            format!(
                "- `{}` {:.0} -> {:.0} ({:+.0})",
                c.key, c.old_score, c.new_score, c.score_diff
            )
        }));
        lines.push(String::new());
    }

    lines
}

/// Render the Markdown report.
pub fn render_markdown(
    ranked: &[RankedEntry],
    summary: &RunSummary,
    diff: Option<&DiffReport>,
) -> Result<String, ReportError> {
    let rows: Vec<ReportRow> = ranked.iter().map(ReportRow::from_entry).collect();

    let report = MarkdownReport {
        generated_at: summary.generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        elapsed: format!("{:.1}s", summary.elapsed_secs),
        total: summary.total,
        succeeded: summary.succeeded,
        failed: summary.failed,
        duplicates: summary.duplicates,
        invalid: summary.invalid,
        settings: format!(
            "{} scoring, {} round(s)",
            summary.scoring_mode, summary.rounds
        ),
        ordering: match summary.sort_by {
            crate::ranking::SortBy::Quality => {
                "loss tier first (perfect, good, acceptable, poor), then delay, then download speed".to_string()
            }
            other => format!("by {}", other),
        },
        tiers: tier_counts(ranked)
            .into_iter()
            .map(|(tier, count)| format!("{}: {}", tier, count))
            .collect(),
        rows: rows.iter().filter(|r| r.success).map(table_row).collect(),
        failures: rows
            .iter()
            .filter(|r| !r.success)
            .map(|r| {
                format!(
                    "`{}`: {}",
                    r.original,
                    r.failure_reason.as_deref().unwrap_or("unknown")
                )
            })
            .collect(),
        has_history: diff.is_some(),
        history_time: diff.map(|d| d.history_timestamp.clone()).unwrap_or_default(),
        recommendation: diff
            .map(|d| format!("{}: {}", d.recommendation, d.recommendation.describe()))
            .unwrap_or_default(),
        trend: diff.map(|d| format!("{:+.1}", d.trend)).unwrap_or_default(),
        history_lines: diff.map(history_lines).unwrap_or_default(),
    };

    Ok(report.render()?)
}
