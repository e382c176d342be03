//! Group analysis entry points.
//!
//! `start_group_analysis` resolves the control group, registers a job and
//! hands the work to a detached task; `poll_job` reads the job back. The
//! caller never awaits the background task itself.

use crate::analysis::orchestrator::{BatchOrchestrator, GroupPlan};
use crate::evidence::EvidenceRef;
use crate::jobs::JobStore;
use crate::models::{Control, ControlSet, JobState, MatchStrategy};
use crate::resolver::ControlResolver;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Errors surfaced before a job is created.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no related controls found for control {0}")]
    NoControls(String),
}

/// Handle returned when a group analysis starts.
#[derive(Debug, Clone, Serialize)]
pub struct GroupJobStarted {
    pub job_id: String,
    pub strategy: MatchStrategy,
    pub controls_total: usize,
}

/// Starts group analyses and exposes their job state.
#[derive(Clone)]
pub struct GroupAnalysisService {
    resolver: ControlResolver,
    orchestrator: Arc<BatchOrchestrator>,
    jobs: JobStore,
}

impl GroupAnalysisService {
    pub fn new(
        resolver: ControlResolver,
        orchestrator: Arc<BatchOrchestrator>,
        jobs: JobStore,
    ) -> Self {
        Self {
            resolver,
            orchestrator,
            jobs,
        }
    }

    /// Resolve the control group without starting anything.
    pub async fn resolve(&self, reference: &Control) -> ControlSet {
        self.resolver.resolve(reference).await
    }

    /// Resolve the group for `reference` and start analyzing `evidence` against it.
    ///
    /// Returns as soon as the job is registered.
    pub async fn start_group_analysis(
        &self,
        evidence: EvidenceRef,
        reference: &Control,
    ) -> Result<GroupJobStarted, StartError> {
        let set = self.resolver.resolve(reference).await;
        if set.strategy == MatchStrategy::None || set.is_empty() {
            return Err(StartError::NoControls(reference.number.clone()));
        }

        let job_id = Uuid::new_v4().to_string();
        let started = GroupJobStarted {
            job_id: job_id.clone(),
            strategy: set.strategy,
            controls_total: set.controls.len(),
        };

        self.jobs.create(
            &job_id,
            JobState::processing(&job_id, set.controls.len(), Utc::now()),
        );
        info!(
            "Started job {} for control {} ({} controls via {})",
            job_id,
            reference.number,
            started.controls_total,
            started.strategy
        );

        let plan = GroupPlan {
            reference: reference.number.clone(),
            title: reference.title.clone(),
            strategy: set.strategy,
            controls: set.controls,
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            orchestrator.run(&job_id, &evidence, &plan, &jobs).await;
        });

        Ok(started)
    }

    /// Current state of a job.
    pub fn poll_job(&self, job_id: &str) -> Option<JobState> {
        self.jobs.get(job_id)
    }
}
