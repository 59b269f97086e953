//! Configuration module for edgerank.
//!
//! A run is configured in layers: built-in defaults, an optional test-mode
//! preset, a TOML file, `EDGERANK_*` environment variables and finally
//! command line flags. Every layer is a [`ConfigLayer`] of optional values;
//! [`ConfigBuilder::build`] merges them and validates the result.
//! Out-of-range values are replaced by their default and reported as a
//! [`ConfigWarning`] instead of failing the run.

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ranking::SortBy;
use crate::scoring::{ScoringMode, ScoringOptions};
use crate::stats::OutlierMethod;

/// Upper bounds of the count options.
const MAX_PING_COUNT: i64 = 100;
const MAX_WORKERS: i64 = 1024;
const MAX_ROUNDS: i64 = 10;
const MAX_ATTEMPTS: i64 = 100;
const MAX_QUICK_ATTEMPTS: i64 = 10;
const MAX_RESULTS: i64 = 10_000;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// A value that was out of range and has been replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWarning {
    pub option: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.option, self.message)
    }
}

/// Run configuration with every option resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub ping_count: u32,
    pub ping_timeout: Duration,
    pub tcp_timeout: Duration,
    /// Deep probe concurrency.
    pub max_workers: usize,

    pub enable_quick_check: bool,
    pub quick_check_workers: usize,
    pub quick_ping_count: u32,
    pub quick_ping_timeout: Duration,
    pub quick_tcp_timeout: Duration,
    /// Total quick check attempts per target.
    pub quick_retry_attempts: u32,
    pub quick_retry_delay: Duration,

    pub enable_multi_round: bool,
    pub test_rounds: u32,
    pub outlier_filter_method: OutlierMethod,
    pub confidence_level: f64,

    pub enable_http_test: bool,
    pub http_test_url: String,
    pub http_timeout: Duration,
    pub score_include_http: bool,

    pub enable_download_test: bool,
    pub download_url: String,
    pub download_duration: Duration,
    pub download_timeout: Duration,

    pub enable_stability_test: bool,
    pub stability_attempts: u32,

    pub scoring_mode: ScoringMode,
    pub sort_by: SortBy,
    /// Entries written to the best-targets export.
    pub max_results: usize,
    /// Port probed when a target does not name one.
    pub default_port: u16,
    /// Slack added to every per-target time budget.
    pub target_budget_buffer: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ping_count: 10,
            ping_timeout: Duration::from_secs(2),
            tcp_timeout: Duration::from_secs(5),
            max_workers: 10,
            enable_quick_check: true,
            quick_check_workers: 50,
            quick_ping_count: 3,
            quick_ping_timeout: Duration::from_secs(1),
            quick_tcp_timeout: Duration::from_millis(2500),
            quick_retry_attempts: 2,
            quick_retry_delay: Duration::from_millis(500),
            enable_multi_round: true,
            test_rounds: 3,
            outlier_filter_method: OutlierMethod::Iqr,
            confidence_level: 0.95,
            enable_http_test: true,
            http_test_url: "https://cp.cloudflare.com/generate_204".to_string(),
            http_timeout: Duration::from_secs(10),
            score_include_http: true,
            enable_download_test: false,
            download_url: "https://speed.cloudflare.com/__down?bytes=100000000".to_string(),
            download_duration: Duration::from_secs(10),
            download_timeout: Duration::from_secs(15),
            enable_stability_test: true,
            stability_attempts: 10,
            scoring_mode: ScoringMode::Proxy,
            sort_by: SortBy::Quality,
            max_results: 30,
            default_port: 443,
            target_budget_buffer: Duration::from_secs(5),
        }
    }
}

impl RunConfig {
    /// Number of deep-probe rounds actually run.
    pub fn effective_rounds(&self) -> u32 {
        if self.enable_multi_round {
            self.test_rounds.max(1)
        } else {
            1
        }
    }

    pub fn scoring(&self) -> ScoringOptions {
        ScoringOptions {
            mode: self.scoring_mode,
            include_http: self.enable_http_test && self.score_include_http,
        }
    }
}

/// Named presets trading accuracy for speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Single round, no stability test.
    Fast,
    Balanced,
    /// Three rounds with every test enabled.
    Thorough,
}

impl TestMode {
    pub const ALL: [TestMode; 3] = [TestMode::Fast, TestMode::Balanced, TestMode::Thorough];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Fast => "fast",
            TestMode::Balanced => "balanced",
            TestMode::Thorough => "thorough",
        }
    }

    /// The preset as a configuration layer.
    pub fn layer(&self) -> ConfigLayer {
        let (multi_round, rounds, download, stability, ping_count, workers, quick_workers, attempts) = match self {
            TestMode::Fast => (false, 1, false, false, 5, 20, 50, None),
            TestMode::Balanced => (true, 2, false, true, 10, 10, 50, Some(10)),
            TestMode::Thorough => (true, 3, true, true, 15, 5, 30, Some(15)),
        };
        ConfigLayer {
            enable_quick_check: Some(true),
            enable_multi_round: Some(multi_round),
            test_rounds: Some(rounds),
            enable_http_test: Some(true),
            enable_download_test: Some(download),
            enable_stability_test: Some(stability),
            ping_count: Some(ping_count),
            max_workers: Some(workers),
            quick_check_workers: Some(quick_workers),
            stability_attempts: attempts,
            ..Default::default()
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown test mode: {}", s))
    }
}

/// One layer of optional settings. Durations are in seconds, enum values
/// are kept as strings until the layers are merged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub test_mode: Option<String>,
    pub ping_count: Option<i64>,
    pub ping_timeout: Option<f64>,
    pub tcp_timeout: Option<f64>,
    pub max_workers: Option<i64>,
    pub enable_quick_check: Option<bool>,
    pub quick_check_workers: Option<i64>,
    pub quick_ping_count: Option<i64>,
    pub quick_ping_timeout: Option<f64>,
    pub quick_tcp_timeout: Option<f64>,
    pub quick_retry_attempts: Option<i64>,
    pub quick_retry_delay: Option<f64>,
    pub enable_multi_round: Option<bool>,
    pub test_rounds: Option<i64>,
    pub outlier_filter_method: Option<String>,
    pub confidence_level: Option<f64>,
    pub enable_http_test: Option<bool>,
    pub http_test_url: Option<String>,
    pub http_timeout: Option<f64>,
    pub score_include_http: Option<bool>,
    pub enable_download_test: Option<bool>,
    pub download_url: Option<String>,
    pub download_duration: Option<f64>,
    pub download_timeout: Option<f64>,
    pub enable_stability_test: Option<bool>,
    pub stability_attempts: Option<i64>,
    pub scoring_mode: Option<String>,
    pub sort_by: Option<String>,
    pub max_results: Option<i64>,
    pub default_port: Option<i64>,
    pub target_budget_buffer: Option<f64>,
}

macro_rules! overlay {
    ($base:expr, $top:expr, $($field:ident),+ $(,)?) => {
        $(
            if $top.$field.is_some() {
                $base.$field = $top.$field;
            }
        )+
    };
}

impl ConfigLayer {
    /// Read a layer from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Read a layer from `EDGERANK_*` environment variables.
    ///
    /// Environment variables:
    /// - `EDGERANK_TEST_MODE`: preset name
    /// - `EDGERANK_MAX_WORKERS`, `EDGERANK_QUICK_CHECK_WORKERS`: concurrency
    /// - `EDGERANK_TEST_ROUNDS`, `EDGERANK_PING_COUNT`: probe volume
    /// - `EDGERANK_PING_TIMEOUT`, `EDGERANK_TCP_TIMEOUT`, `EDGERANK_HTTP_TIMEOUT`: seconds
    /// - `EDGERANK_HTTP_TEST_URL`, `EDGERANK_DOWNLOAD_URL`
    /// - `EDGERANK_ENABLE_DOWNLOAD_TEST`, `EDGERANK_ENABLE_QUICK_CHECK`: booleans
    /// - `EDGERANK_SCORING_MODE`, `EDGERANK_SORT_BY`, `EDGERANK_MAX_RESULTS`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(&format!("EDGERANK_{}", key.to_ascii_uppercase()));
        let int = |key: &str| get(key).and_then(|v| v.trim().parse::<i64>().ok());
        let float = |key: &str| get(key).and_then(|v| v.trim().parse::<f64>().ok());
        let flag = |key: &str| {
            get(key).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
        };

        Self {
            test_mode: get("test_mode"),
            ping_count: int("ping_count"),
            ping_timeout: float("ping_timeout"),
            tcp_timeout: float("tcp_timeout"),
            max_workers: int("max_workers"),
            enable_quick_check: flag("enable_quick_check"),
            quick_check_workers: int("quick_check_workers"),
            enable_multi_round: flag("enable_multi_round"),
            test_rounds: int("test_rounds"),
            outlier_filter_method: get("outlier_filter_method"),
            confidence_level: float("confidence_level"),
            enable_http_test: flag("enable_http_test"),
            http_test_url: get("http_test_url"),
            http_timeout: float("http_timeout"),
            enable_download_test: flag("enable_download_test"),
            download_url: get("download_url"),
            enable_stability_test: flag("enable_stability_test"),
            stability_attempts: int("stability_attempts"),
            scoring_mode: get("scoring_mode"),
            sort_by: get("sort_by"),
            max_results: int("max_results"),
            default_port: int("default_port"),
            ..Default::default()
        }
    }

    /// Apply every value set in `top` over this layer.
    pub fn merge(&mut self, top: ConfigLayer) {
        overlay!(
            self,
            top,
            test_mode,
            ping_count,
            ping_timeout,
            tcp_timeout,
            max_workers,
            enable_quick_check,
            quick_check_workers,
            quick_ping_count,
            quick_ping_timeout,
            quick_tcp_timeout,
            quick_retry_attempts,
            quick_retry_delay,
            enable_multi_round,
            test_rounds,
            outlier_filter_method,
            confidence_level,
            enable_http_test,
            http_test_url,
            http_timeout,
            score_include_http,
            enable_download_test,
            download_url,
            download_duration,
            download_timeout,
            enable_stability_test,
            stability_attempts,
            scoring_mode,
            sort_by,
            max_results,
            default_port,
            target_budget_buffer,
        );
    }
}

/// Merges configuration layers into a validated [`RunConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    merged: ConfigLayer,
}

struct Validator {
    warnings: Vec<ConfigWarning>,
}

impl Validator {
    fn warn(&mut self, option: &'static str, message: String) {
        self.warnings.push(ConfigWarning { option, message });
    }

    fn count<T>(&mut self, option: &'static str, value: Option<i64>, default: T, max: i64) -> T
    where
        T: TryFrom<i64> + fmt::Display + Copy,
    {
        match value {
            None => default,
            Some(v) => match T::try_from(v) {
                Ok(n) if (1..=max).contains(&v) => n,
                _ => {
                    self.warn(option, format!("{} is outside 1..={}, using {}", v, max, default));
                    default
                }
            },
        }
    }

    fn seconds(&mut self, option: &'static str, value: Option<f64>, default: Duration) -> Duration {
        match value {
            None => default,
            Some(v) if v.is_finite() && v > 0.0 && v < 86_400.0 => Duration::from_secs_f64(v),
            Some(v) => {
                self.warn(
                    option,
                    format!("{} must be a positive number of seconds, using {:?}", v, default),
                );
                default
            }
        }
    }

    fn choice<T>(&mut self, option: &'static str, value: Option<String>, default: T) -> T
    where
        T: FromStr<Err = String> + fmt::Display,
    {
        match value.map(|v| v.parse::<T>()) {
            None => default,
            Some(Ok(v)) => v,
            Some(Err(e)) => {
                self.warn(option, format!("{}, using {}", e, default));
                default
            }
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer on top of the ones already added.
    pub fn layer(mut self, layer: ConfigLayer) -> Self {
        self.merged.merge(layer);
        self
    }

    /// Resolve the merged layers. The preset named by the top-most
    /// `test_mode` sits between the defaults and every explicit value.
    pub fn build(self) -> (RunConfig, Vec<ConfigWarning>) {
        let defaults = RunConfig::default();
        let mut v = Validator { warnings: Vec::new() };

        let mut layer = match self.merged.test_mode.clone() {
            Some(name) => match name.parse::<TestMode>() {
                Ok(mode) => mode.layer(),
                Err(e) => {
                    v.warn("test_mode", format!("{}, using no preset", e));
                    ConfigLayer::default()
                }
            },
            None => ConfigLayer::default(),
        };
        layer.merge(self.merged);

        let confidence_level = match layer.confidence_level {
            None => defaults.confidence_level,
            Some(c) if c > 0.0 && c < 1.0 => c,
            Some(c) => {
                v.warn(
                    "confidence_level",
                    format!("{} must be between 0 and 1, using {}", c, defaults.confidence_level),
                );
                defaults.confidence_level
            }
        };

        let default_port = match layer.default_port {
            None => defaults.default_port,
            Some(p) => match u16::try_from(p) {
                Ok(port) if port > 0 => port,
                _ => {
                    v.warn("default_port", format!("{} is not a valid port, using {}", p, defaults.default_port));
                    defaults.default_port
                }
            },
        };

        let download_duration = v.seconds("download_duration", layer.download_duration, defaults.download_duration);
        let mut download_timeout = v.seconds("download_timeout", layer.download_timeout, defaults.download_timeout);
        let min_download_timeout = download_duration + Duration::from_secs(2);
        if download_timeout < min_download_timeout {
            let corrected = download_duration + Duration::from_secs(5);
            v.warn(
                "download_timeout",
                format!(
                    "{:?} is shorter than download_duration + 2s, using {:?}",
                    download_timeout, corrected
                ),
            );
            download_timeout = corrected;
        }

        let config = RunConfig {
            ping_count: v.count("ping_count", layer.ping_count, defaults.ping_count, MAX_PING_COUNT),
            ping_timeout: v.seconds("ping_timeout", layer.ping_timeout, defaults.ping_timeout),
            tcp_timeout: v.seconds("tcp_timeout", layer.tcp_timeout, defaults.tcp_timeout),
            max_workers: v.count("max_workers", layer.max_workers, defaults.max_workers, MAX_WORKERS),
            enable_quick_check: layer.enable_quick_check.unwrap_or(defaults.enable_quick_check),
            quick_check_workers: v.count(
                "quick_check_workers",
                layer.quick_check_workers,
                defaults.quick_check_workers,
                MAX_WORKERS,
            ),
            quick_ping_count: v.count(
                "quick_ping_count",
                layer.quick_ping_count,
                defaults.quick_ping_count,
                MAX_PING_COUNT,
            ),
            quick_ping_timeout: v.seconds(
                "quick_ping_timeout",
                layer.quick_ping_timeout,
                defaults.quick_ping_timeout,
            ),
            quick_tcp_timeout: v.seconds("quick_tcp_timeout", layer.quick_tcp_timeout, defaults.quick_tcp_timeout),
            quick_retry_attempts: v.count(
                "quick_retry_attempts",
                layer.quick_retry_attempts,
                defaults.quick_retry_attempts,
                MAX_QUICK_ATTEMPTS,
            ),
            quick_retry_delay: v.seconds("quick_retry_delay", layer.quick_retry_delay, defaults.quick_retry_delay),
            enable_multi_round: layer.enable_multi_round.unwrap_or(defaults.enable_multi_round),
            test_rounds: v.count("test_rounds", layer.test_rounds, defaults.test_rounds, MAX_ROUNDS),
            outlier_filter_method: v.choice(
                "outlier_filter_method",
                layer.outlier_filter_method,
                defaults.outlier_filter_method,
            ),
            confidence_level,
            enable_http_test: layer.enable_http_test.unwrap_or(defaults.enable_http_test),
            http_test_url: layer.http_test_url.unwrap_or(defaults.http_test_url),
            http_timeout: v.seconds("http_timeout", layer.http_timeout, defaults.http_timeout),
            score_include_http: layer.score_include_http.unwrap_or(defaults.score_include_http),
            enable_download_test: layer.enable_download_test.unwrap_or(defaults.enable_download_test),
            download_url: layer.download_url.unwrap_or(defaults.download_url),
            download_duration,
            download_timeout,
            enable_stability_test: layer.enable_stability_test.unwrap_or(defaults.enable_stability_test),
            stability_attempts: v.count(
                "stability_attempts",
                layer.stability_attempts,
                defaults.stability_attempts,
                MAX_ATTEMPTS,
            ),
            scoring_mode: v.choice("scoring_mode", layer.scoring_mode, defaults.scoring_mode),
            sort_by: v.choice("sort_by", layer.sort_by, defaults.sort_by),
            max_results: v.count("max_results", layer.max_results, defaults.max_results, MAX_RESULTS),
            default_port,
            target_budget_buffer: v.seconds(
                "target_budget_buffer",
                layer.target_budget_buffer,
                defaults.target_budget_buffer,
            ),
        };

        (config, v.warnings)
    }
}
