//! Data models for the evidence auditor.
//!
//! This module contains the core data structures used throughout
//! the application for representing controls, outcomes, jobs and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

/// Compliance verdict for a single control (or a whole group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    /// The evidence fully satisfies the requirement.
    Compliant,
    /// The evidence covers part of the requirement.
    Partial,
    /// The evidence contradicts or fails the requirement.
    NonCompliant,
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplianceStatus::Compliant => write!(f, "Compliant"),
            ComplianceStatus::Partial => write!(f, "Partial"),
            ComplianceStatus::NonCompliant => write!(f, "Non-compliant"),
        }
    }
}

impl ComplianceStatus {
    /// Returns an emoji representation of the status.
    pub fn emoji(&self) -> &'static str {
        match self {
            ComplianceStatus::Compliant => "🟢",
            ComplianceStatus::Partial => "🟡",
            ComplianceStatus::NonCompliant => "🔴",
        }
    }

    /// Lenient parse of a model-provided status label.
    ///
    /// Unknown labels map to `Partial` so a vague answer never reads as a pass.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "compliant" | "fully_compliant" | "pass" | "passed" => ComplianceStatus::Compliant,
            "non_compliant" | "noncompliant" | "not_compliant" | "fail" | "failed" => {
                ComplianceStatus::NonCompliant
            }
            _ => ComplianceStatus::Partial,
        }
    }
}

/// A single compliance requirement within a framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    /// Stable identifier of the control record.
    pub id: String,
    /// Framework the control belongs to.
    #[serde(default)]
    pub framework_id: String,
    /// Control number, e.g. "3" or "3.1".
    pub number: String,
    /// Short title.
    pub title: String,
    /// Requirement text the evidence is checked against.
    #[serde(default)]
    pub requirement: String,
    /// Category or group label.
    #[serde(default)]
    pub category: Option<String>,
    /// Number of the explicit parent control, if the framework records one.
    #[serde(default)]
    pub parent_ref: Option<String>,
}

impl Control {
    /// Identity snapshot carried by outcomes.
    pub fn as_ref_record(&self) -> ControlRef {
        ControlRef {
            control_id: self.id.clone(),
            number: self.number.clone(),
            title: self.title.clone(),
        }
    }
}

/// Identity of a control inside an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRef {
    pub control_id: String,
    pub number: String,
    pub title: String,
}

/// Token counts reported by the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Normalized response of one external analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub status: ComplianceStatus,
    /// Compliance score, 0-100.
    pub compliance_score: f64,
    /// Model confidence, 0-100.
    pub confidence_score: f64,
    pub summary: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Context shared by every control analyzed in one group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub evidence_id: String,
    /// Display name of the evidence artifact (file name).
    pub evidence_name: String,
    /// Title of the reference control the group was resolved from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_title: Option<String>,
}

/// Successful per-control analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedControl {
    #[serde(flatten)]
    pub control: ControlRef,
    pub status: ComplianceStatus,
    pub compliance_score: f64,
    pub confidence_score: f64,
    pub summary: String,
    /// Identifier of the persisted result row; `None` when persistence failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    pub usage: TokenUsage,
}

/// Per-control analysis that ended in a terminal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedControl {
    #[serde(flatten)]
    pub control: ControlRef,
    /// Always `error`, so outcomes can be filtered by status alone.
    #[serde(default = "error_status")]
    pub status: OutcomeStatus,
    pub error: String,
}

fn error_status() -> OutcomeStatus {
    OutcomeStatus::Error
}

/// Outcome of analyzing one control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    Analyzed(AnalyzedControl),
    Failed(FailedControl),
}

/// Status of an outcome, with `Error` alongside the compliance verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Compliant,
    Partial,
    NonCompliant,
    Error,
}

impl From<ComplianceStatus> for OutcomeStatus {
    fn from(status: ComplianceStatus) -> Self {
        match status {
            ComplianceStatus::Compliant => OutcomeStatus::Compliant,
            ComplianceStatus::Partial => OutcomeStatus::Partial,
            ComplianceStatus::NonCompliant => OutcomeStatus::NonCompliant,
        }
    }
}

impl ControlOutcome {
    pub fn error(control: &Control, message: impl Into<String>) -> Self {
        ControlOutcome::Failed(FailedControl {
            control: control.as_ref_record(),
            status: OutcomeStatus::Error,
            error: message.into(),
        })
    }

    pub fn control(&self) -> &ControlRef {
        match self {
            ControlOutcome::Analyzed(a) => &a.control,
            ControlOutcome::Failed(f) => &f.control,
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        match self {
            ControlOutcome::Analyzed(a) => a.status.into(),
            ControlOutcome::Failed(_) => OutcomeStatus::Error,
        }
    }

    pub fn usage(&self) -> TokenUsage {
        match self {
            ControlOutcome::Analyzed(a) => a.usage,
            ControlOutcome::Failed(_) => TokenUsage::default(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControlOutcome::Failed(_))
    }
}

/// Summary statistics over all outcomes of a group analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub total: usize,
    pub compliant: usize,
    pub partial: usize,
    pub non_compliant: usize,
    pub errors: usize,
    /// Mean compliance score over non-error outcomes.
    pub average_compliance: f64,
    /// Mean confidence score over non-error outcomes.
    pub average_confidence: f64,
    pub overall_status: ComplianceStatus,
}

/// How the control set of a group was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ParentLink,
    Category,
    Prefix,
    None,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchStrategy::ParentLink => write!(f, "parent_link"),
            MatchStrategy::Category => write!(f, "category"),
            MatchStrategy::Prefix => write!(f, "prefix"),
            MatchStrategy::None => write!(f, "none"),
        }
    }
}

/// Result of resolving a reference control into its group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSet {
    pub strategy: MatchStrategy,
    pub controls: Vec<Control>,
}

impl ControlSet {
    pub fn none() -> Self {
        Self {
            strategy: MatchStrategy::None,
            controls: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

/// Lifecycle status of a group analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Metadata attached to a completed group analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub evidence_id: String,
    pub evidence_name: String,
    /// Number of the reference control the group was resolved from.
    pub reference_control: String,
    pub strategy: MatchStrategy,
    pub batches: usize,
    pub usage: TokenUsage,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Final result of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAnalysisResult {
    pub aggregate: Aggregate,
    pub outcomes: Vec<ControlOutcome>,
    pub metadata: JobMetadata,
}

/// Poll-able state of a group analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: String,
    pub controls_total: usize,
    pub controls_completed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GroupAnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobState {
    /// Creates a fresh job in the `processing` state.
    pub fn processing(
        job_id: impl Into<String>,
        controls_total: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Processing,
            started_at: now,
            completed_at: None,
            progress: "Queued".to_string(),
            controls_total,
            controls_completed: 0,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != JobStatus::Processing
    }

    /// Update progress while processing; ignored once the job is terminal.
    ///
    /// `controls_completed` never decreases.
    pub fn record_progress(&mut self, progress: String, completed: Option<usize>) {
        if self.is_terminal() {
            return;
        }
        self.progress = progress;
        if let Some(completed) = completed {
            self.controls_completed = self.controls_completed.max(completed);
        }
    }

    /// Moves the job to `completed`. No-op on a job that is already terminal.
    pub fn complete(&mut self, result: GroupAnalysisResult, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.controls_completed = self.controls_total.max(self.controls_completed);
        self.progress = format!(
            "Completed {}/{} controls",
            self.controls_completed, self.controls_total
        );
        self.result = Some(result);
        self.error = None;
    }

    /// Moves the job to `failed`. No-op on a job that is already terminal.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        let error = error.into();
        self.status = JobStatus::Failed;
        self.completed_at = Some(now);
        self.progress = format!("Failed: {}", error);
        self.result = None;
        self.error = Some(error);
    }
}

/// Derived record comparing a requirement against the evidence verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonArtifact {
    pub control_number: String,
    pub requirement: String,
    /// Leading part of the evidence text (empty for image evidence).
    pub evidence_excerpt: String,
    pub verdict: ComplianceStatus,
    pub compliance_score: f64,
    pub summary: String,
}

/// Result row written to the data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub evidence_id: String,
    pub control_id: String,
    pub status: ComplianceStatus,
    pub compliance_score: f64,
    pub confidence_score: f64,
    pub summary: String,
    pub comparison: ComparisonArtifact,
    pub usage: TokenUsage,
    pub analyzed_at: DateTime<Utc>,
}
