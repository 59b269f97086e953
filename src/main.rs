//! EdgeRank - edge node quality assessment
//!
//! Probes a list of candidate edge nodes, scores and ranks them, and
//! compares the ranking with the previous run.

mod cli;
mod config;
mod history;
mod pipeline;
mod probe;
mod ranking;
mod report;
mod scheduler;
mod scoring;
mod stats;
mod targets;

use cli::Cli;
use config::{ConfigBuilder, ConfigLayer};
use pipeline::OutputOptions;
use probe::NetworkProber;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Rows printed in the console summary.
const SUMMARY_ROWS: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse_args();

    // Initialize logging
    let directive = if cli.verbose { "edgerank=debug" } else { "edgerank=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    // Load configuration: defaults < preset < file < env < flags
    let mut builder = ConfigBuilder::new();
    if let Some(path) = &cli.config {
        builder = builder.layer(ConfigLayer::from_file(path)?);
        tracing::info!("Using config file {}", path.display());
    }
    let (cfg, warnings) = builder
        .layer(ConfigLayer::from_env())
        .layer(cli.config_layer())
        .build();
    for warning in &warnings {
        tracing::warn!("Config: {}", warning);
    }

    // Gather target lines: files first, then URLs
    let mut lines = Vec::new();
    for path in cli.input_files() {
        match targets::read_target_file(&path).await {
            Ok(read) => {
                tracing::info!("Read {} lines from {}", read.len(), path.display());
                lines.extend(read);
            }
            Err(e) => tracing::warn!("Registry: {}", e),
        }
    }
    if !cli.urls.is_empty() {
        lines.extend(targets::fetch_target_urls(&cli.urls, Duration::from_secs(30), 2).await);
    }
    let loaded = targets::load(lines);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling outstanding probes");
            on_signal.cancel();
        }
    });
    if let Some(limit) = cli.run_timeout() {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tracing::warn!("Run timeout of {:?} reached, cancelling outstanding probes", limit);
            on_timeout.cancel();
        });
    }

    let output = OutputOptions {
        output_dir: cli.output_dir.clone(),
        history_path: cli.history_path(),
    };

    tracing::info!(
        "Starting EdgeRank: {} scoring, {} round(s), {} workers",
        cfg.scoring_mode,
        cfg.effective_rounds(),
        cfg.max_workers
    );

    let result = pipeline::run(Arc::new(NetworkProber::new()), Arc::new(cfg), loaded, &output, cancel).await?;

    report::print_summary(&result.ranked, &result.summary, result.diff.as_ref(), SUMMARY_ROWS);
    println!();
    println!("Reports written:");
    for path in [&result.files.markdown, &result.files.json, &result.files.best] {
        println!("  {}", path.display());
    }

    Ok(())
}
