//! Batch orchestration of a group analysis.
//!
//! The orchestrator fetches the evidence once, then walks the control list in
//! consecutive batches. Controls inside a batch are analyzed concurrently;
//! batch K+1 starts only after every control of batch K has settled. Progress
//! and the final result are written to the [`JobStore`]; nothing is returned.

use crate::analysis::aggregator::aggregate;
use crate::analysis::retry::RetryingAnalyzer;
use crate::evidence::{DocumentSource, EvidenceError, EvidenceRef, LocalEvidence};
use crate::jobs::JobStore;
use crate::models::{
    AnalysisContext, Control, ControlOutcome, GroupAnalysisResult, JobMetadata, MatchStrategy,
    TokenUsage,
};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Batching settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Controls analyzed concurrently per batch.
    pub concurrency: usize,
    /// Pause between consecutive batches.
    pub batch_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            batch_delay: Duration::ZERO,
        }
    }
}

/// Everything the orchestrator needs to know about the group.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    /// Number of the reference control.
    pub reference: String,
    /// Title of the reference control.
    pub title: String,
    pub strategy: MatchStrategy,
    pub controls: Vec<Control>,
}

/// Outcomes gathered over all batches.
struct BatchRun {
    outcomes: Vec<ControlOutcome>,
    usage: TokenUsage,
    batches: usize,
}

/// Drives per-control analyses over a resolved control group.
pub struct BatchOrchestrator {
    analyzer: RetryingAnalyzer,
    documents: Arc<dyn DocumentSource>,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        analyzer: RetryingAnalyzer,
        documents: Arc<dyn DocumentSource>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            analyzer,
            documents,
            config,
        }
    }

    /// Run the whole group analysis for `job_id` and finalize the job.
    ///
    /// Per-control failures end up inside the result; failures around the
    /// batch loop (evidence download or parsing) fail the job as a whole and
    /// discard any outcomes gathered so far.
    pub async fn run(
        &self,
        job_id: &str,
        evidence: &EvidenceRef,
        plan: &GroupPlan,
        jobs: &JobStore,
    ) {
        let clock = Instant::now();
        let started_at = jobs
            .get(job_id)
            .map(|state| state.started_at)
            .unwrap_or_else(Utc::now);

        info!(
            "Job {}: analyzing {} against {} controls ({})",
            job_id,
            evidence.name,
            plan.controls.len(),
            plan.strategy
        );

        match self.execute(job_id, evidence, plan, jobs).await {
            Ok(run) => {
                let completed_at = Utc::now();
                let aggregate = aggregate(&run.outcomes);
                info!(
                    "Job {}: completed, overall {} ({} errors, {} tokens)",
                    job_id,
                    aggregate.overall_status,
                    aggregate.errors,
                    run.usage.total()
                );

                let result = GroupAnalysisResult {
                    aggregate,
                    outcomes: run.outcomes,
                    metadata: JobMetadata {
                        evidence_id: evidence.id.clone(),
                        evidence_name: evidence.name.clone(),
                        reference_control: plan.reference.clone(),
                        strategy: plan.strategy,
                        batches: run.batches,
                        usage: run.usage,
                        started_at,
                        completed_at,
                        duration_seconds: clock.elapsed().as_secs_f64(),
                    },
                };
                jobs.update(job_id, |state| state.complete(result, completed_at));
            }
            Err(e) => {
                error!("Job {}: failed: {}", job_id, e);
                jobs.update(job_id, |state| state.fail(e.to_string(), Utc::now()));
            }
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        evidence: &EvidenceRef,
        plan: &GroupPlan,
        jobs: &JobStore,
    ) -> Result<BatchRun, EvidenceError> {
        jobs.update(job_id, |state| {
            state.record_progress(format!("Downloading evidence {}", evidence.name), None)
        });

        let local = self.documents.download(evidence).await?;
        let result = self.analyze_batches(job_id, &local, evidence, plan, jobs).await;
        self.documents.cleanup(local).await;
        result
    }

    async fn analyze_batches(
        &self,
        job_id: &str,
        local: &LocalEvidence,
        evidence: &EvidenceRef,
        plan: &GroupPlan,
        jobs: &JobStore,
    ) -> Result<BatchRun, EvidenceError> {
        let content = self.documents.extract(local).await?;
        let context = AnalysisContext {
            evidence_id: evidence.id.clone(),
            evidence_name: evidence.name.clone(),
            group_title: Some(plan.title.clone()),
        };

        let width = self.config.concurrency.max(1);
        let batches: Vec<&[Control]> = plan.controls.chunks(width).collect();
        let total_batches = batches.len();

        let mut run = BatchRun {
            outcomes: Vec::with_capacity(plan.controls.len()),
            usage: TokenUsage::default(),
            batches: 0,
        };

        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 && !self.config.batch_delay.is_zero() {
                debug!(
                    "Job {}: waiting {}ms before next batch",
                    job_id,
                    self.config.batch_delay.as_millis()
                );
                tokio::time::sleep(self.config.batch_delay).await;
            }

            jobs.update(job_id, |state| {
                state.record_progress(
                    format!(
                        "Analyzing batch {}/{} ({} controls)",
                        index + 1,
                        total_batches,
                        batch.len()
                    ),
                    None,
                )
            });

            let outcomes = join_all(
                batch
                    .iter()
                    .map(|control| self.analyzer.analyze(control, &content, &context)),
            )
            .await;

            let failed = outcomes.iter().filter(|o| o.is_error()).count();
            if failed > 0 {
                warn!(
                    "Job {}: {} of {} controls in batch {} failed",
                    job_id,
                    failed,
                    batch.len(),
                    index + 1
                );
            }

            for outcome in outcomes {
                run.usage += outcome.usage();
                run.outcomes.push(outcome);
            }
            run.batches += 1;

            let completed = run.outcomes.len();
            let total = plan.controls.len();
            jobs.update(job_id, |state| {
                state.record_progress(
                    format!(
                        "Completed batch {}/{} ({}/{} controls)",
                        index + 1,
                        total_batches,
                        completed,
                        total
                    ),
                    Some(completed),
                )
            });
            debug!("Job {}: {}/{} controls done", job_id, completed, total);
        }

        Ok(run)
    }
}
