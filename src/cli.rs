//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// EvidAudit - LLM-powered compliance evidence analyzer
///
/// Check one evidence document against a whole group of related controls
/// using a local model. Markdown/JSON reports. Built in Rust.
///
/// Examples:
///   evidaudit --evidence policy.pdf.txt --controls iso27001.json --control A.5
///   evidaudit --evidence screenshot.png --controls soc2.json --control CC6 --format json
///   evidaudit --evidence policy.md --controls nist.json --control 3 --dry-run
///   evidaudit --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Evidence file to analyze (text or image)
    #[arg(short, long, value_name = "FILE", required_unless_present = "init_config")]
    pub evidence: Option<PathBuf>,

    /// Control catalog (JSON array of control records)
    #[arg(long, value_name = "FILE", required_unless_present = "init_config")]
    pub controls: Option<PathBuf>,

    /// Number of the reference control whose group is analyzed
    #[arg(long, value_name = "NUMBER", required_unless_present = "init_config")]
    pub control: Option<String>,

    /// Framework id, when the catalog holds several frameworks
    #[arg(long, value_name = "ID")]
    pub framework: Option<String>,

    /// Ollama model to use for analysis
    ///
    /// Can also be set via EVIDAUDIT_MODEL env var or .evidaudit.toml config.
    #[arg(short, long, default_value = "llama3.2:latest", env = "EVIDAUDIT_MODEL")]
    pub model: String,

    /// Output file path for the report
    ///
    /// Defaults to the config file's output, then evidaudit_report.md.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Ollama API endpoint URL
    #[arg(long, default_value = "http://localhost:11434", env = "OLLAMA_URL")]
    pub ollama_url: String,

    /// Path to configuration file
    ///
    /// If not specified, looks for .evidaudit.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Number of controls analyzed concurrently per batch
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Pause between batches in milliseconds
    #[arg(long, value_name = "MS")]
    pub batch_delay_ms: Option<u64>,

    /// Rate-limit retry delays in seconds (comma-separated)
    ///
    /// Example: --retry-delays 30,60,120
    #[arg(long, value_name = "SECS", value_delimiter = ',')]
    pub retry_delays: Option<Vec<u64>>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Temperature for LLM responses (0.0 - 1.0)
    #[arg(long, default_value = "0.1")]
    pub temperature: f32,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Also write the persisted result rows to this JSON file
    #[arg(long, value_name = "FILE")]
    pub results_out: Option<PathBuf>,

    /// Fail if the overall status is at or below this level
    ///
    /// Useful for CI pipelines. Exit code 2 when the threshold is met.
    /// Values: partial, non-compliant
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<FailOnLevel>,

    /// Dry run: resolve the control group without calling the LLM
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .evidaudit.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Overall status threshold for --fail-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FailOnLevel {
    /// Fail on partial or non-compliant
    Partial,
    /// Fail only on non-compliant
    NonCompliant,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(ref evidence) = self.evidence {
            if !evidence.is_file() {
                return Err(format!("Evidence file does not exist: {}", evidence.display()));
            }
        }

        if let Some(ref controls) = self.controls {
            if !controls.is_file() {
                return Err(format!(
                    "Control catalog does not exist: {}",
                    controls.display()
                ));
            }
        }

        if self.control.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err("Reference control number must not be empty".to_string());
        }

        // Validate Ollama URL format (not needed for dry-run)
        if !self.dry_run
            && !self.ollama_url.starts_with("http://")
            && !self.ollama_url.starts_with("https://")
        {
            return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
        }

        // Validate temperature range
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err("Temperature must be between 0.0 and 1.0".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `--quiet` wins over a config file that asks for verbose logging.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
