//! Server configuration
//!
//! Sources, later overriding earlier: built-in defaults, an optional config
//! file (TOML, YAML or JSON by extension) and `CLOGS__`-prefixed environment
//! variables, e.g. `CLOGS__LISTEN_PORT=9000` or
//! `CLOGS__STORE_RETRY__MAX_ATTEMPTS=5`.

use anyhow::{Context, Result};
use clogs_lib::engine::{EngineConfig, LogPatternSpec, RuleSet, ThresholdRuleSpec};
use clogs_lib::{
    ConfigError, CoreSettings, PipelineConfig, RegistryConfig, RetryPolicy, StoreConfig,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given
const DEFAULT_CONFIG_NAME: &str = "clogs";

/// Store write retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreRetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for agent ingest, queries, health and metrics
    pub listen_port: u16,

    /// Instance name attached to structured log events
    pub instance: String,

    pub heartbeat_timeout_secs: u64,
    pub liveness_timeout_secs: u64,
    pub evaluation_window_secs: u64,

    /// Defaults to half the heartbeat timeout
    pub sweep_interval_secs: Option<u64>,

    pub max_samples_per_series: usize,
    /// Distinct metrics kept per container; the least recently written goes first
    pub max_series_per_container: usize,
    pub max_log_lines: usize,
    pub max_age_secs: u64,
    pub compress_repeated_logs: bool,

    /// Per-agent intake queue capacity
    pub intake_queue_capacity: usize,
    /// An agent's intake worker exits after this long without events
    pub intake_idle_secs: u64,
    pub store_retry: StoreRetryConfig,

    /// `/health` fails when the sweep, or ingestion with events waiting,
    /// has not progressed for this long
    pub progress_window_secs: u64,
    pub liveness_marker_path: PathBuf,
    pub shutdown_grace_secs: u64,

    pub metric_threshold_rules: Vec<ThresholdRuleSpec>,
    pub log_pattern_rules: Vec<LogPatternSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            instance: "clogs-server".to_string(),
            heartbeat_timeout_secs: 60,
            liveness_timeout_secs: 90,
            evaluation_window_secs: 300,
            sweep_interval_secs: None,
            max_samples_per_series: 1_000,
            max_series_per_container: 100,
            max_log_lines: 1_000,
            max_age_secs: 24 * 60 * 60,
            compress_repeated_logs: true,
            intake_queue_capacity: 256,
            intake_idle_secs: 300,
            store_retry: StoreRetryConfig::default(),
            progress_window_secs: 120,
            liveness_marker_path: PathBuf::from("/tmp/clogs-server.alive"),
            shutdown_grace_secs: 10,
            metric_threshold_rules: Vec::new(),
            log_pattern_rules: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration. An explicitly named file must exist; otherwise
    /// `clogs.{toml,yaml,json}` in the working directory is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("CLOGS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(";")
                    .with_list_parse_key("metric_threshold_rules"),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn progress_window(&self) -> Duration {
        Duration::from_secs(self.progress_window_secs)
    }

    /// Validate and translate into core settings. Any error is fatal at startup.
    pub fn core_settings(&self) -> Result<CoreSettings, ConfigError> {
        positive("heartbeat_timeout_secs", self.heartbeat_timeout_secs)?;
        positive("liveness_timeout_secs", self.liveness_timeout_secs)?;
        positive("evaluation_window_secs", self.evaluation_window_secs)?;
        positive("max_samples_per_series", self.max_samples_per_series as u64)?;
        positive("max_series_per_container", self.max_series_per_container as u64)?;
        positive("max_log_lines", self.max_log_lines as u64)?;
        positive("max_age_secs", self.max_age_secs)?;
        positive("intake_queue_capacity", self.intake_queue_capacity as u64)?;
        positive("intake_idle_secs", self.intake_idle_secs)?;
        positive("progress_window_secs", self.progress_window_secs)?;
        positive("store_retry.max_attempts", self.store_retry.max_attempts as u64)?;
        if let Some(interval) = self.sweep_interval_secs {
            positive("sweep_interval_secs", interval)?;
        }
        if self.store_retry.initial_backoff_ms > self.store_retry.max_backoff_ms {
            return Err(ConfigError::InvalidSetting {
                key: "store_retry.initial_backoff_ms",
                reason: "must not exceed store_retry.max_backoff_ms".to_string(),
            });
        }

        let rules = RuleSet::compile(&self.metric_threshold_rules, &self.log_pattern_rules)?;

        Ok(CoreSettings {
            instance: self.instance.clone(),
            registry: RegistryConfig {
                heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
                liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            },
            store: StoreConfig {
                max_samples_per_series: self.max_samples_per_series,
                max_series_per_container: self.max_series_per_container,
                max_log_lines: self.max_log_lines,
                max_age: Duration::from_secs(self.max_age_secs),
                compress_repeated_logs: self.compress_repeated_logs,
            },
            engine: EngineConfig {
                evaluation_window: Duration::from_secs(self.evaluation_window_secs),
            },
            pipeline: PipelineConfig {
                intake_capacity: self.intake_queue_capacity,
                idle_timeout: Duration::from_secs(self.intake_idle_secs),
                retry: RetryPolicy {
                    max_attempts: self.store_retry.max_attempts,
                    initial_backoff: Duration::from_millis(self.store_retry.initial_backoff_ms),
                    max_backoff: Duration::from_millis(self.store_retry.max_backoff_ms),
                },
            },
            rules,
            sweep_interval: self.sweep_interval_secs.map(Duration::from_secs),
        })
    }
}

fn positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidSetting {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        let settings = config.core_settings().unwrap();

        assert_eq!(settings.registry.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(settings.effective_sweep_interval(), Duration::from_secs(30));
        assert_eq!(settings.store.max_log_lines, 1_000);
        assert_eq!(settings.pipeline.intake_capacity, 256);
        assert_eq!(settings.pipeline.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.store.max_series_per_container, 100);
    }

    #[test]
    fn test_load_toml_with_rules() {
        let (_dir, path) = write_config(
            "clogs.toml",
            r#"
listen_port = 9000
heartbeat_timeout_secs = 20
metric_threshold_rules = [
    "cpu > 90 for 60s -> degraded",
    { metric = "mem", op = ">=", threshold = 95, severity = "unhealthy" },
]

[[log_pattern_rules]]
name = "oom"
pattern = "(?i)out of memory"

[store_retry]
max_attempts = 5
"#,
        );

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.store_retry.max_attempts, 5);
        assert_eq!(config.store_retry.initial_backoff_ms, 50);

        let settings = config.core_settings().unwrap();
        assert_eq!(settings.rules.thresholds.len(), 2);
        assert_eq!(settings.rules.log_patterns.len(), 1);
        assert_eq!(settings.effective_sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServerConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_invalid_rule_is_fatal() {
        let config = ServerConfig {
            metric_threshold_rules: vec![ThresholdRuleSpec::Expression("cpu >>> 1".into())],
            ..Default::default()
        };
        assert!(matches!(
            config.core_settings(),
            Err(ConfigError::InvalidThresholdRule { .. })
        ));
    }

    #[test]
    fn test_zero_settings_rejected() {
        let config = ServerConfig {
            max_log_lines: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.core_settings(),
            Err(ConfigError::InvalidSetting { key: "max_log_lines", .. })
        ));

        let config = ServerConfig {
            store_retry: StoreRetryConfig {
                initial_backoff_ms: 5_000,
                max_backoff_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.core_settings().is_err());

        let config = ServerConfig {
            intake_idle_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.core_settings(),
            Err(ConfigError::InvalidSetting { key: "intake_idle_secs", .. })
        ));
    }
}
