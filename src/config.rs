//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.evidaudit.toml` files.

use crate::analysis::orchestrator::OrchestratorConfig;
use crate::analysis::retry::RetryPolicy;
use crate::analysis::EngineConfig;
use crate::jobs::JobStoreConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".evidaudit.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Batch analysis settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Job tracking settings.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "evidaudit_report.md".to_string()
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    300
}

/// Batch analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Controls analyzed concurrently per batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pause between batches in milliseconds.
    #[serde(default)]
    pub batch_delay_ms: u64,

    /// Delays before each rate-limit retry, in seconds.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_delay_ms: 0,
            retry_delays_secs: default_retry_delays(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}

fn default_retry_delays() -> Vec<u64> {
    vec![30, 60, 120]
}

/// Job tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Seconds a finished job stays pollable.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Seconds a job may run before it is force-failed.
    #[serde(default = "default_max_processing")]
    pub max_processing_secs: u64,

    /// Seconds between housekeeping sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Milliseconds between job polls from the CLI.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            max_processing_secs: default_max_processing(),
            sweep_interval_secs: default_sweep_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_retention() -> u64 {
    3600
}

fn default_max_processing() -> u64 {
    1800
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    1000
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Include the model's summary for each control.
    #[serde(default = "default_true")]
    pub include_summaries: bool,

    /// Number of weakest controls listed in the report.
    #[serde(default = "default_weakest")]
    pub weakest_controls: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            include_summaries: true,
            weakest_controls: default_weakest(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_weakest() -> usize {
    5
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// Optional flags only override when given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        // Model settings - always override since they have defaults in CLI
        self.model.name = args.model.clone();
        self.model.ollama_url = args.ollama_url.clone();
        self.model.temperature = args.temperature;

        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }

        if let Some(concurrency) = args.concurrency {
            self.analysis.concurrency = concurrency;
        }
        if let Some(delay) = args.batch_delay_ms {
            self.analysis.batch_delay_ms = delay;
        }
        if let Some(ref delays) = args.retry_delays {
            self.analysis.retry_delays_secs = delays.clone();
        }

        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Report path after merging.
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.general.output)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ollama_url: self.model.ollama_url.clone(),
            model_name: self.model.name.clone(),
            temperature: self.model.temperature,
            timeout_seconds: self.model.timeout_seconds,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.analysis.concurrency.max(1),
            batch_delay: Duration::from_millis(self.analysis.batch_delay_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(&self.analysis.retry_delays_secs)
    }

    pub fn job_store_config(&self) -> JobStoreConfig {
        JobStoreConfig {
            retention: Duration::from_secs(self.jobs.retention_secs),
            max_processing: Duration::from_secs(self.jobs.max_processing_secs),
            sweep_interval: Duration::from_secs(self.jobs.sweep_interval_secs.max(1)),
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model.name, "llama3.2:latest");
        assert_eq!(config.analysis.concurrency, 3);
        assert_eq!(config.analysis.retry_delays_secs, vec![30, 60, 120]);
        assert_eq!(config.jobs.max_processing_secs, 1800);
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output = "custom_report.md"
verbose = true

[model]
name = "qwen2.5:14b"
temperature = 0.2

[analysis]
concurrency = 5
batch_delay_ms = 2000
retry_delays_secs = [10, 20]

[jobs]
retention_secs = 60
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output, "custom_report.md");
        assert!(config.general.verbose);
        assert_eq!(config.model.name, "qwen2.5:14b");
        assert_eq!(config.model.temperature, 0.2);
        assert_eq!(config.analysis.concurrency, 5);
        assert_eq!(config.jobs.retention_secs, 60);
        assert_eq!(config.jobs.max_processing_secs, 1800);

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.batch_delay, Duration::from_secs(2));
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(20)));
    }

    fn parse_args(extra: &[&str]) -> crate::cli::Args {
        use clap::Parser;
        let mut argv = vec![
            "evidaudit",
            "--evidence",
            "e.txt",
            "--controls",
            "c.json",
            "--control",
            "3",
        ];
        argv.extend_from_slice(extra);
        crate::cli::Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_general_settings_apply_without_flags() {
        let mut config: Config = toml::from_str(
            r#"
[general]
output = "audits/q3.md"
verbose = true
"#,
        )
        .unwrap();
        let args = parse_args(&[]);
        config.merge_with_args(&args);

        assert_eq!(config.output_path(), PathBuf::from("audits/q3.md"));
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::DEBUG);
    }

    #[test]
    fn test_output_flag_overrides_config() {
        let mut config = Config::default();
        config.general.output = "audits/q3.md".to_string();
        config.merge_with_args(&parse_args(&["--output", "cli.json"]));
        assert_eq!(config.output_path(), PathBuf::from("cli.json"));

        let mut defaults = Config::default();
        defaults.merge_with_args(&parse_args(&[]));
        assert_eq!(defaults.output_path(), PathBuf::from("evidaudit_report.md"));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let mut config = Config::default();
        config.analysis.concurrency = 0;
        assert_eq!(config.orchestrator_config().concurrency, 1);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[model]"));
        assert!(toml_str.contains("[analysis]"));
        assert!(toml_str.contains("[jobs]"));
    }
}
