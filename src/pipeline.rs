//! One complete assessment run: probe, score, rank, diff and report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::history::{diff, DiffReport, HistorySnapshot};
use crate::probe::Prober;
use crate::ranking::{rank, Outcome, RankedEntry, Tier};
use crate::report::{self, ReportError, ReportFiles, RunSummary};
use crate::scheduler::Scheduler;
use crate::scoring;
use crate::targets::{LoadedTargets, Target};

/// Pipeline error types.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no targets to test")]
    NoTargets,
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Where a run reads and writes its files.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputOptions {
    pub output_dir: PathBuf,
    /// Snapshot file; `None` disables history.
    pub history_path: Option<PathBuf>,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunResult {
    pub ranked: Vec<RankedEntry>,
    pub summary: RunSummary,
    pub diff: Option<DiffReport>,
    pub files: ReportFiles,
}

/// Probe, score and rank `targets`.
pub async fn evaluate(
    prober: Arc<dyn Prober>,
    config: Arc<RunConfig>,
    targets: Vec<Target>,
    cancel: CancellationToken,
) -> Result<Vec<RankedEntry>, PipelineError> {
    if targets.is_empty() {
        return Err(PipelineError::NoTargets);
    }

    let options = config.scoring();
    let sort_by = config.sort_by;
    let scheduler = Scheduler::new(prober, config, cancel);

    let entries = scheduler
        .run(&targets)
        .await
        .into_iter()
        .map(|outcome| {
            let result = match outcome.result {
                Ok(metrics) => Outcome::Scored {
                    scores: scoring::score(&metrics, options),
                    tier: Tier::from_loss(metrics.loss_rate),
                    metrics,
                },
                Err(reason) => {
                    tracing::debug!("Pipeline: {} failed: {}", outcome.target, reason);
                    Outcome::Failed { reason }
                }
            };
            RankedEntry::unranked(outcome.index, outcome.target, result)
        })
        .collect();

    Ok(rank(entries, sort_by))
}

/// Compare against the previous snapshot, then replace it unless `keep_previous`.
fn update_history(path: &std::path::Path, current: &HistorySnapshot, keep_previous: bool) -> Option<DiffReport> {
    let report = match HistorySnapshot::load(path) {
        Ok(Some(previous)) => {
            let report = diff(current, &previous);
            tracing::info!(
                "History: compared with run from {}, recommendation {}",
                report.history_timestamp,
                report.recommendation
            );
            Some(report)
        }
        Ok(None) => {
            tracing::info!("History: no previous snapshot at {}", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("History: skipping comparison: {}", e);
            None
        }
    };

    if keep_previous {
        tracing::warn!("History: run was cancelled, keeping the previous snapshot");
    } else if let Err(e) = current.save(path) {
        tracing::warn!("History: failed to save snapshot: {}", e);
    }
    report
}

/// Run a full assessment over the loaded targets and write every report.
pub async fn run(
    prober: Arc<dyn Prober>,
    config: Arc<RunConfig>,
    loaded: LoadedTargets,
    output: &OutputOptions,
    cancel: CancellationToken,
) -> Result<RunResult, PipelineError> {
    let started = Instant::now();
    let generated_at = Utc::now();
    let (duplicates, invalid) = (loaded.duplicates, loaded.invalid);
    let targets = loaded.into_targets().map_err(|_| PipelineError::NoTargets)?;

    tracing::info!(
        "Pipeline: testing {} targets ({} duplicates, {} invalid skipped)",
        targets.len(),
        duplicates,
        invalid
    );

    let ranked = evaluate(prober, config.clone(), targets, cancel.clone()).await?;

    // A partial ranking must not become the next run's baseline.
    let cancelled = cancel.is_cancelled();
    let diff = output.history_path.as_deref().and_then(|path| {
        let snapshot = HistorySnapshot::from_ranked(&ranked, generated_at);
        update_history(path, &snapshot, cancelled)
    });

    let succeeded = ranked.iter().filter(|e| e.is_success()).count();
    let summary = RunSummary {
        generated_at,
        elapsed_secs: started.elapsed().as_secs_f64(),
        total: ranked.len(),
        succeeded,
        failed: ranked.len() - succeeded,
        duplicates,
        invalid,
        rounds: config.effective_rounds(),
        scoring_mode: config.scoring_mode,
        sort_by: config.sort_by,
    };

    let files = report::write_reports(
        &output.output_dir,
        &ranked,
        &summary,
        diff.as_ref(),
        config.max_results,
    )?;

    Ok(RunResult {
        ranked,
        summary,
        diff,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Recommendation;
    use crate::probe::testing::{HostScript, ScriptedProber};
    use crate::targets::load;

    fn config() -> Arc<RunConfig> {
        Arc::new(RunConfig {
            enable_stability_test: false,
            quick_retry_delay: std::time::Duration::from_millis(1),
            ..RunConfig::default()
        })
    }

    fn two_hosts() -> Arc<ScriptedProber> {
        Arc::new(
            ScriptedProber::new()
                .with_host("8.8.8.8", HostScript::healthy(&[10.0, 12.0, 11.0], 0.0))
                .with_host("1.1.1.1", HostScript::healthy(&[500.0, 520.0, 510.0], 20.0)),
        )
    }

    #[tokio::test]
    async fn test_loss_tier_beats_score() {
        let targets = load(["1.1.1.1", "8.8.8.8"]).into_targets().unwrap();
        let ranked = evaluate(two_hosts(), config(), targets, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].target.host, "8.8.8.8");
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].tier(), Some(Tier::Perfect));
        assert_eq!(ranked[1].target.host, "1.1.1.1");
        assert_eq!(ranked[1].tier(), Some(Tier::Poor));

        for entry in &ranked {
            let scores = entry.scores().unwrap();
            for v in [
                scores.availability,
                scores.speed,
                scores.stability,
                scores.responsiveness,
                scores.overall,
                scores.streaming,
                scores.gaming,
                scores.rtc,
            ] {
                assert!(v <= 100);
            }
        }
    }

    #[tokio::test]
    async fn test_empty_target_list_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputOptions {
            output_dir: dir.path().to_path_buf(),
            history_path: None,
        };

        let loaded = load(["", "   ", "#only:a:comment"]);
        let result = run(two_hosts(), config(), loaded, &output, CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::NoTargets)));
        assert!(!dir.path().join("result.md").exists());

        let direct = evaluate(two_hosts(), config(), Vec::new(), CancellationToken::new()).await;
        assert!(matches!(direct, Err(PipelineError::NoTargets)));
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_every_target() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let targets = load(["8.8.8.8", "1.1.1.1"]).into_targets().unwrap();
        let ranked = evaluate(two_hosts(), config(), targets, cancel).await.unwrap();
        assert_eq!(ranked.len(), 2);
        for entry in &ranked {
            assert_eq!(entry.failure_reason(), Some("cancelled"));
        }
    }

    #[tokio::test]
    async fn test_run_writes_reports_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputOptions {
            output_dir: dir.path().join("out"),
            history_path: Some(dir.path().join("out/result_history.json")),
        };

        let first = run(
            two_hosts(),
            config(),
            load(["8.8.8.8#US-dns", "1.1.1.1", "8.8.8.8"]),
            &output,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(first.diff.is_none());
        assert_eq!(first.summary.duplicates, 1);
        assert_eq!(first.summary.succeeded, 2);
        assert!(first.files.markdown.exists());
        assert!(output.history_path.as_ref().unwrap().exists());

        let best = std::fs::read_to_string(&first.files.best).unwrap();
        assert_eq!(best.lines().next(), Some("8.8.8.8#US"));

        let second = run(
            two_hosts(),
            config(),
            load(["8.8.8.8", "1.1.1.1"]),
            &output,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let report = second.diff.unwrap();
        assert!(report.new.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(report.recommendation, Recommendation::Stable);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let history = dir.path().join("result_history.json");
        let output = OutputOptions {
            output_dir: dir.path().join("out"),
            history_path: Some(history.clone()),
        };

        run(
            two_hosts(),
            config(),
            load(["8.8.8.8", "1.1.1.1"]),
            &output,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let baseline = std::fs::read(&history).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = run(two_hosts(), config(), load(["8.8.8.8", "1.1.1.1"]), &output, cancel)
            .await
            .unwrap();
        assert_eq!(cancelled.summary.succeeded, 0);
        assert_eq!(cancelled.diff.unwrap().removed.len(), 2);
        assert_eq!(std::fs::read(&history).unwrap(), baseline);

        let next = run(
            two_hosts(),
            config(),
            load(["8.8.8.8", "1.1.1.1"]),
            &output,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let report = next.diff.unwrap();
        assert!(report.new.is_empty());
        assert_eq!(report.recommendation, Recommendation::Stable);
    }
}
