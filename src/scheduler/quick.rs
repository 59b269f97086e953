//! Phase 1: cheap availability screen.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{run_phase, Interruption, PhaseResult, RetryPolicy};
use crate::config::RunConfig;
use crate::probe::{ping_budget, ProbeError, Prober};
use crate::targets::Target;

/// Outcome of the quick screen for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum QuickCheck {
    /// Answered ping and accepted a TCP connection.
    Available { quick_delay: f64 },
    Unavailable { reason: String },
}

fn retry_policy(config: &RunConfig) -> RetryPolicy {
    RetryPolicy::new(config.quick_retry_attempts, config.quick_retry_delay)
}

/// Worst-case wall time of one quick check.
pub fn quick_budget(config: &RunConfig) -> Duration {
    let per_attempt =
        ping_budget(config.quick_ping_count, config.quick_ping_timeout).saturating_add(config.quick_tcp_timeout);
    retry_policy(config)
        .worst_case(per_attempt)
        .saturating_add(config.target_budget_buffer)
}

/// One reduced ping, then a TCP connect only if the ping got a reply.
async fn screen_once(prober: &dyn Prober, host: &str, port: u16, config: &RunConfig) -> Result<f64, ProbeError> {
    let sample = prober
        .ping(host, config.quick_ping_count, config.quick_ping_timeout)
        .await?;
    let delay = sample
        .avg_delay()
        .ok_or_else(|| ProbeError::Unreachable("no ping reply".to_string()))?;

    let tcp = prober.tcp_connect(host, port, config.quick_tcp_timeout).await?;
    if !tcp.success {
        return Err(ProbeError::Unreachable(
            tcp.failure_reason.unwrap_or_else(|| "tcp connect failed".to_string()),
        ));
    }

    Ok(delay)
}

/// Screen one target, retrying per the configured policy.
pub async fn quick_check(prober: &dyn Prober, target: &Target, config: &RunConfig) -> QuickCheck {
    let port = target.port_or(config.default_port);
    let label = target.key();

    match retry_policy(config)
        .run(&label, |_| screen_once(prober, &target.host, port, config))
        .await
    {
        Ok(quick_delay) => QuickCheck::Available { quick_delay },
        Err(e) => QuickCheck::Unavailable {
            reason: format!("quick check: {}", e),
        },
    }
}

fn quick_interrupted(i: Interruption) -> QuickCheck {
    QuickCheck::Unavailable { reason: i.to_string() }
}

/// Run the quick screen over `targets`.
pub async fn run_quick_phase(
    prober: Arc<dyn Prober>,
    config: Arc<RunConfig>,
    targets: Vec<(usize, Target)>,
    cancel: &CancellationToken,
) -> Vec<PhaseResult<QuickCheck>> {
    let workers = config.quick_check_workers;
    let budget = quick_budget(&config);

    run_phase(
        "quick check",
        targets,
        workers,
        budget,
        cancel,
        move |target| {
            let prober = prober.clone();
            let config = config.clone();
            async move { quick_check(prober.as_ref(), &target, &config).await }
        },
        quick_interrupted,
    )
    .await
}
