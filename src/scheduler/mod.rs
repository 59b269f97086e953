//! Scheduler module for running the two probe phases.
//!
//! Phase 1 screens every target cheaply at high concurrency; phase 2 runs
//! the full probe set over the survivors at lower concurrency. Each phase
//! is a bounded worker pool whose results flow through a channel into a
//! single collector task.

mod deep;
mod quick;
mod retry;

pub use deep::*;
pub use quick::*;
pub use retry::*;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::probe::Prober;
use crate::targets::Target;

/// Why a worker produced no result of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    TimedOut(Duration),
    Panicked(String),
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Cancelled => f.write_str("cancelled"),
            Interruption::TimedOut(budget) => write!(f, "timed out after {:.1}s", budget.as_secs_f64()),
            Interruption::Panicked(msg) => write!(f, "probe panicked: {}", msg),
        }
    }
}

/// One target's result from a phase.
#[derive(Debug, Clone)]
pub struct PhaseResult<T> {
    pub index: usize,
    pub target: Target,
    pub result: T,
}

/// Final scheduler state of one target.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    /// Position in the loaded target list.
    pub index: usize,
    pub target: Target,
    /// Metrics of a probed target, or the reason it failed.
    pub result: Result<TargetMetrics, String>,
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Run `work` over `targets` with at most `workers` in flight.
///
/// Every target yields exactly one result: a worker that is cancelled,
/// exceeds `budget` or panics reports `interrupted(..)` instead. Results
/// come back sorted by target index.
pub async fn run_phase<T, F, Fut>(
    phase: &'static str,
    targets: Vec<(usize, Target)>,
    workers: usize,
    budget: Duration,
    cancel: &CancellationToken,
    work: F,
    interrupted: fn(Interruption) -> T,
) -> Vec<PhaseResult<T>>
where
    T: Send + 'static,
    F: Fn(Target) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let total = targets.len();
    if total == 0 {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let (tx, rx) = mpsc::channel(total);
    let collector = tokio::spawn(run_collector(phase, rx, total));
    let work = Arc::new(work);

    tracing::info!(
        "Scheduler: {} starting for {} targets with {} workers",
        phase,
        total,
        workers.max(1)
    );

    let mut set = JoinSet::new();
    for (index, target) in targets {
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        let work = work.clone();
        let cancel = cancel.clone();

        set.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => interrupted(Interruption::Cancelled),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(_permit) => {
                        // A nested task turns a panic into a JoinError.
                        let task = tokio::spawn(work(target.clone()));
                        let abort = task.abort_handle();
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                abort.abort();
                                interrupted(Interruption::Cancelled)
                            }
                            joined = tokio::time::timeout(budget, task) => match joined {
                                Ok(Ok(value)) => value,
                                Ok(Err(e)) if e.is_panic() => {
                                    let msg = panic_message(e);
                                    tracing::error!("Scheduler: {} worker for {} panicked: {}", phase, target, msg);
                                    interrupted(Interruption::Panicked(msg))
                                }
                                Ok(Err(_)) => interrupted(Interruption::Cancelled),
                                Err(_) => {
                                    abort.abort();
                                    tracing::warn!("Scheduler: {} for {} exceeded {:?}", phase, target, budget);
                                    interrupted(Interruption::TimedOut(budget))
                                }
                            }
                        }
                    }
                    Err(_) => interrupted(Interruption::Cancelled),
                },
            };

            let name = target.key();
            if tx.send(PhaseResult { index, target, result }).await.is_err() {
                tracing::error!("Failed to send {} result for {}", phase, name);
            }
        });
    }
    drop(tx);

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Scheduler: {} worker failed: {}", phase, e);
        }
    }

    let mut results = match collector.await {
        Ok(results) => results,
        Err(e) => {
            tracing::error!("Scheduler: {} collector failed: {}", phase, e);
            Vec::new()
        }
    };
    results.sort_by_key(|r| r.index);
    results
}

/// Collect phase results until every sender is gone.
async fn run_collector<T>(phase: &'static str, mut rx: mpsc::Receiver<PhaseResult<T>>, total: usize) -> Vec<PhaseResult<T>> {
    let mut results = Vec::with_capacity(total);
    let step = (total / 10).max(1);

    while let Some(result) = rx.recv().await {
        results.push(result);
        let done = results.len();
        if done % step == 0 || done == total {
            tracing::info!("Scheduler: {} progress {}/{}", phase, done, total);
        }
    }

    results
}

/// Drives both probe phases over a target list.
pub struct Scheduler {
    prober: Arc<dyn Prober>,
    config: Arc<RunConfig>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(prober: Arc<dyn Prober>, config: Arc<RunConfig>, cancel: CancellationToken) -> Self {
        Self {
            prober,
            config,
            cancel,
        }
    }

    /// Probe every target. The result holds one outcome per target, in
    /// input order.
    pub async fn run(&self, targets: &[Target]) -> Vec<TargetOutcome> {
        let indexed: Vec<(usize, Target)> = targets.iter().cloned().enumerate().collect();
        let mut outcomes = Vec::with_capacity(indexed.len());

        let (survivors, quick_delays) = if self.config.enable_quick_check {
            let screened = run_quick_phase(self.prober.clone(), self.config.clone(), indexed, &self.cancel).await;

            let mut survivors = Vec::new();
            let mut delays = HashMap::new();
            for r in screened {
                match r.result {
                    QuickCheck::Available { quick_delay } => {
                        delays.insert(r.index, quick_delay);
                        survivors.push((r.index, r.target));
                    }
                    QuickCheck::Unavailable { reason } => outcomes.push(TargetOutcome {
                        index: r.index,
                        target: r.target,
                        result: Err(reason),
                    }),
                }
            }
            tracing::info!(
                "Scheduler: quick check kept {}/{} targets",
                survivors.len(),
                targets.len()
            );
            (survivors, delays)
        } else {
            (indexed, HashMap::new())
        };

        let probed = run_deep_phase(self.prober.clone(), self.config.clone(), survivors, &self.cancel).await;
        for r in probed {
            let quick_delay = quick_delays.get(&r.index).copied();
            let result = r.result.map(|mut metrics| {
                metrics.quick_delay = quick_delay;
                metrics
            });
            outcomes.push(TargetOutcome {
                index: r.index,
                target: r.target,
                result,
            });
        }

        outcomes.sort_by_key(|o| o.index);
        outcomes
    }
}
