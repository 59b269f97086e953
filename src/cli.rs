use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::ConfigLayer;
use crate::history::DEFAULT_HISTORY_PATH;

const DEFAULT_TARGET_FILE: &str = "data/input/targets.txt";

#[derive(Parser, Debug)]
#[command(name = "edgerank")]
#[command(version)]
#[command(about = "Probe candidate edge nodes and rank them by connection quality")]
pub struct Cli {
    /// Target list files, one `host[:port][#tag]` per line
    #[arg(value_name = "FILES")]
    pub files: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Download a target list from this URL (repeatable)
    #[arg(short, long = "url", value_name = "URL")]
    pub urls: Vec<String>,

    /// Test preset: fast, balanced or thorough
    #[arg(short, long)]
    pub mode: Option<String>,

    #[arg(short, long, value_name = "DIR", default_value = "data/output")]
    pub output_dir: PathBuf,

    /// History snapshot file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_HISTORY_PATH)]
    pub history: PathBuf,

    /// Skip the comparison with the previous run
    #[arg(long)]
    pub no_history: bool,

    /// Cancel the whole run after this many seconds
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[arg(long)]
    pub max_results: Option<u32>,

    /// quality, overall, streaming, gaming, rtc, delay or loss
    #[arg(short, long)]
    pub sort_by: Option<String>,

    /// Deep probe workers
    #[arg(short, long)]
    pub workers: Option<u32>,

    /// Quick check workers
    #[arg(long)]
    pub quick_workers: Option<u32>,

    #[arg(long)]
    pub no_quick_check: bool,

    /// Deep probe rounds per target
    #[arg(short, long)]
    pub rounds: Option<u32>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The top configuration layer formed by the flags.
    pub fn config_layer(&self) -> ConfigLayer {
        ConfigLayer {
            test_mode: self.mode.clone(),
            max_workers: self.workers.map(i64::from),
            quick_check_workers: self.quick_workers.map(i64::from),
            enable_quick_check: self.no_quick_check.then_some(false),
            test_rounds: self.rounds.map(i64::from),
            enable_multi_round: self.rounds.map(|r| r > 1),
            sort_by: self.sort_by.clone(),
            max_results: self.max_results.map(i64::from),
            ..Default::default()
        }
    }

    /// Files to read targets from; the default list when no source is given.
    pub fn input_files(&self) -> Vec<PathBuf> {
        if self.files.is_empty() && self.urls.is_empty() {
            vec![PathBuf::from(DEFAULT_TARGET_FILE)]
        } else {
            self.files.clone()
        }
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        (!self.no_history).then(|| self.history.clone())
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|&s| s > 0).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::ranking::SortBy;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("edgerank").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.input_files(), vec![PathBuf::from(DEFAULT_TARGET_FILE)]);
        assert_eq!(cli.history_path(), Some(PathBuf::from(DEFAULT_HISTORY_PATH)));
        assert_eq!(cli.output_dir, PathBuf::from("data/output"));
        assert_eq!(cli.run_timeout(), None);
        assert_eq!(cli.config_layer(), ConfigLayer::default());
    }

    #[test]
    fn test_url_replaces_default_file() {
        let cli = parse(&["--url", "https://lists.example/a.txt", "-u", "https://lists.example/b.txt"]);
        assert!(cli.input_files().is_empty());
        assert_eq!(cli.urls.len(), 2);
    }

    #[test]
    fn test_flags_override_lower_layers() {
        let cli = parse(&[
            "--mode",
            "fast",
            "--workers",
            "4",
            "--no-quick-check",
            "--sort-by",
            "delay",
            "--rounds",
            "1",
            "--no-history",
            "--timeout",
            "60",
            "a.txt",
        ]);
        assert_eq!(cli.files, vec![PathBuf::from("a.txt")]);
        assert_eq!(cli.history_path(), None);
        assert_eq!(cli.run_timeout(), Some(Duration::from_secs(60)));

        let file = ConfigLayer {
            max_workers: Some(20),
            sort_by: Some("loss".into()),
            ..Default::default()
        };
        let (config, warnings) = ConfigBuilder::new().layer(file).layer(cli.config_layer()).build();
        assert!(warnings.is_empty());
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.sort_by, SortBy::Delay);
        assert!(!config.enable_quick_check);
        assert_eq!(config.effective_rounds(), 1);
    }
}
