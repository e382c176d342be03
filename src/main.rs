//! EvidAudit - LLM-powered compliance evidence analyzer
//!
//! A CLI tool that checks one evidence document against a whole group of
//! related compliance controls using a local Ollama model, and writes a
//! Markdown or JSON report.
//!
//! Exit codes:
//!   0 - Success (overall status above threshold, or no --fail-on set)
//!   1 - Runtime error (catalog, config, connection, failed job, etc.)
//!   2 - Overall status at or below the --fail-on threshold

mod analysis;
mod cli;
mod config;
mod evidence;
mod jobs;
mod models;
mod report;
mod resolver;
mod store;
#[cfg(test)]
mod testing;

use analysis::{
    generate_summary_text, BatchOrchestrator, GroupAnalysisService, OllamaEngine,
    RetryingAnalyzer,
};
use anyhow::{bail, Context, Result};
use cli::{Args, FailOnLevel, OutputFormat};
use config::{Config, CONFIG_FILE};
use evidence::{EvidenceRef, LocalDocumentSource};
use indicatif::{ProgressBar, ProgressStyle};
use jobs::JobStore;
use models::{ComplianceStatus, ControlSet, JobStatus, JobState};
use resolver::ControlResolver;
use std::sync::Arc;
use std::time::Duration;
use store::MemoryStore;
use tracing::{debug, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Config comes first so [general] verbose can raise the log level
    let (mut config, config_source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(args.log_level(config.general.verbose));

    info!("EvidAudit v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config_source);
    debug!("Arguments: {:?}", args);

    match run_audit(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Audit failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .evidaudit.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the model, batching, retries and job limits.");
    Ok(())
}

/// Initialize logging at the given level.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the complete audit workflow. Returns exit code (0 or 2).
async fn run_audit(args: Args, config: Config) -> Result<i32> {
    let (Some(evidence_path), Some(catalog_path), Some(number)) =
        (&args.evidence, &args.controls, &args.control)
    else {
        bail!("--evidence, --controls and --control are required");
    };

    // Step 1: Load the control catalog and find the reference control
    let store = Arc::new(MemoryStore::load(catalog_path)?);
    let reference = store
        .find_control(number.trim(), args.framework.as_deref())
        .cloned()
        .with_context(|| format!("Control {} not found in {}", number, catalog_path.display()))?;

    println!(
        "📋 Reference control: {} - {}",
        reference.number, reference.title
    );

    if args.dry_run {
        let set = ControlResolver::new(store.clone()).resolve(&reference).await;
        return Ok(handle_dry_run(&set));
    }

    // Step 2: Wire the analysis pipeline
    println!("🤖 Initializing analysis...");
    println!("   Model: {}", config.model.name);
    println!("   Ollama: {}", config.model.ollama_url);
    println!(
        "   Batch width: {}",
        config.orchestrator_config().concurrency
    );

    let engine =
        OllamaEngine::new(config.engine_config()).context("Failed to create Ollama client")?;
    let analyzer = RetryingAnalyzer::new(Arc::new(engine), store.clone(), config.retry_policy());
    let orchestrator = BatchOrchestrator::new(
        analyzer,
        Arc::new(LocalDocumentSource),
        config.orchestrator_config(),
    );

    let jobs = JobStore::new(config.job_store_config());
    let sweeper = jobs.spawn_sweeper();
    let service = GroupAnalysisService::new(
        ControlResolver::new(store.clone()),
        Arc::new(orchestrator),
        jobs,
    );

    // Step 3: Start the group analysis and poll it to completion
    let evidence = EvidenceRef::from_path(evidence_path);
    println!("\n🔬 Analyzing {} ...", evidence.name);

    let started = service.start_group_analysis(evidence, &reference).await?;
    println!(
        "   Job {}: {} controls matched by {}",
        started.job_id, started.controls_total, started.strategy
    );

    let progress = progress_bar(started.controls_total as u64, args.quiet)?;
    let state = poll_until_terminal(
        &service,
        &started.job_id,
        Duration::from_millis(config.jobs.poll_interval_ms.max(1)),
        &progress,
    )
    .await?;
    progress.finish_and_clear();
    sweeper.abort();

    if state.status == JobStatus::Failed {
        bail!(
            "Analysis failed: {}",
            state.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    let result = state
        .result
        .context("Completed job carries no result")?;

    // Step 4: Write the report
    println!("\n📝 Generating report...");
    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&result)?,
        OutputFormat::Markdown => {
            report::generate_markdown_report(&result, &config.model.name, &config.report)
        }
    };

    let output_path = config.output_path();
    std::fs::write(&output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    if let Some(ref path) = args.results_out {
        let rows = store.export_results(path)?;
        info!("Exported {} result rows to {}", rows, path.display());
    }

    println!("\n📊 Analysis Summary:");
    for line in generate_summary_text(&result.aggregate).lines() {
        println!("   {}", line);
    }
    println!("   Duration: {:.1}s", result.metadata.duration_seconds);
    println!(
        "\n✅ Audit complete! Report saved to: {}",
        output_path.display()
    );

    // Check --fail-on threshold
    if let Some(fail_level) = args.fail_on {
        if meets_threshold(result.aggregate.overall_status, fail_level) {
            eprintln!(
                "\n⛔ Overall status is {} (threshold {:?}). Failing (exit code 2).",
                result.aggregate.overall_status, fail_level
            );
            return Ok(2);
        }
    }

    Ok(0)
}

/// Handle --dry-run: print the resolved control group, exit.
fn handle_dry_run(set: &ControlSet) -> i32 {
    println!("\n🔍 Dry run: resolving control group (no LLM call)...\n");

    if set.is_empty() {
        println!("   No related controls found.");
    } else {
        println!(
            "   {} controls would be analyzed (matched by {}):\n",
            set.controls.len(),
            set.strategy
        );
        for control in &set.controls {
            println!("     📄 {} - {}", control.number, control.title);
        }
    }

    println!("\n✅ Dry run complete. No LLM calls were made.");
    0
}

fn progress_bar(total: u64, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .context("Invalid progress template")?
        .progress_chars("#>-"),
    );
    Ok(pb)
}

async fn poll_until_terminal(
    service: &GroupAnalysisService,
    job_id: &str,
    interval: Duration,
    progress: &ProgressBar,
) -> Result<JobState> {
    loop {
        let state = service
            .poll_job(job_id)
            .with_context(|| format!("Job {} is no longer tracked", job_id))?;

        progress.set_position(state.controls_completed as u64);
        progress.set_message(state.progress.clone());

        if state.is_terminal() {
            return Ok(state);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Whether the overall status fails the --fail-on level.
fn meets_threshold(status: ComplianceStatus, level: FailOnLevel) -> bool {
    match level {
        FailOnLevel::Partial => status != ComplianceStatus::Compliant,
        FailOnLevel::NonCompliant => status == ComplianceStatus::NonCompliant,
    }
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is set up, so it returns a description of where the
/// configuration came from instead of logging it.
fn load_config(args: &Args) -> Result<(Config, String)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, format!("loaded from {}", config_path.display())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, format!("loaded from {}", CONFIG_FILE))),
        Ok(None) => Ok((Config::default(), "no config file, using defaults".to_string())),
        Err(e) => {
            eprintln!("⚠️  Failed to load config: {:#}", e);
            Ok((Config::default(), "invalid config file, using defaults".to_string()))
        }
    }
}
