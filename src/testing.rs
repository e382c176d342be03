//! Shared fixtures and test doubles.

use crate::analysis::engine::{AnalysisEngine, AnalysisError};
use crate::evidence::{DocumentSource, EvidenceContent, EvidenceError, EvidenceRef, LocalEvidence};
use crate::models::{
    AnalysisContext, AnalysisRecord, AnalysisResponse, ComparisonArtifact, ComplianceStatus,
    Control, TokenUsage,
};
use crate::store::{ControlFilter, DataStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn control(number: &str) -> Control {
    Control {
        id: format!("id-{}", number),
        framework_id: "fw".to_string(),
        number: number.to_string(),
        title: format!("Control {}", number),
        requirement: format!("Requirement text for {}", number),
        category: None,
        parent_ref: None,
    }
}

pub fn context() -> AnalysisContext {
    AnalysisContext {
        evidence_id: "ev-1".to_string(),
        evidence_name: "policy.md".to_string(),
        group_title: Some("Access control".to_string()),
    }
}

pub fn response(status: ComplianceStatus, score: f64) -> AnalysisResponse {
    AnalysisResponse {
        status,
        compliance_score: score,
        confidence_score: 80.0,
        summary: format!("{} evidence", status),
        usage: TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
        },
    }
}

pub fn record_for(evidence_id: &str, control_id: &str) -> AnalysisRecord {
    AnalysisRecord {
        evidence_id: evidence_id.to_string(),
        control_id: control_id.to_string(),
        status: ComplianceStatus::Compliant,
        compliance_score: 90.0,
        confidence_score: 80.0,
        summary: "ok".to_string(),
        comparison: ComparisonArtifact {
            control_number: "1".to_string(),
            requirement: "req".to_string(),
            evidence_excerpt: "text".to_string(),
            verdict: ComplianceStatus::Compliant,
            compliance_score: 90.0,
            summary: "ok".to_string(),
        },
        usage: TokenUsage::default(),
        analyzed_at: Utc::now(),
    }
}

/// Engine that replays scripted results, then a compliant fallback.
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<AnalysisResponse, AnalysisError>>>,
    calls: AtomicUsize,
    image_calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Result<AnalysisResponse, AnalysisError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<AnalysisResponse, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(response(ComplianceStatus::Compliant, 100.0)))
    }
}

#[async_trait]
impl AnalysisEngine for ScriptedEngine {
    async fn analyze_text(
        &self,
        _text: &str,
        _control: &Control,
        _context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError> {
        self.next()
    }

    async fn analyze_image(
        &self,
        _data: &[u8],
        _media_type: &str,
        _control: &Control,
        _context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.next()
    }
}

/// Store whose writes always fail and which holds no controls.
pub struct FailingStore;

#[async_trait]
impl DataStore for FailingStore {
    async fn select_controls(&self, _filter: &ControlFilter) -> Result<Vec<Control>, StoreError> {
        Err(StoreError::Query("database unavailable".to_string()))
    }

    async fn insert_result(&self, _record: &AnalysisRecord) -> Result<String, StoreError> {
        Err(StoreError::Write("disk full".to_string()))
    }
}

/// Document source serving fixed content. Without content, either the
/// download or the extraction fails.
pub struct StaticDocumentSource {
    content: Option<EvidenceContent>,
    downloadable: bool,
    downloads: AtomicUsize,
    cleanups: AtomicUsize,
}

impl StaticDocumentSource {
    pub fn text(text: &str) -> Self {
        Self {
            content: Some(EvidenceContent::Text(text.to_string())),
            downloadable: true,
            downloads: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            content: None,
            downloadable: false,
            downloads: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        }
    }

    /// Downloads fine, then fails to extract.
    pub fn unparseable() -> Self {
        Self {
            content: None,
            downloadable: true,
            downloads: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn download(&self, evidence: &EvidenceRef) -> Result<LocalEvidence, EvidenceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.downloadable {
            Ok(LocalEvidence::borrowed(PathBuf::from(&evidence.name)))
        } else {
            Err(EvidenceError::NotFound(evidence.location.display().to_string()))
        }
    }

    async fn extract(&self, local: &LocalEvidence) -> Result<EvidenceContent, EvidenceError> {
        self.content
            .clone()
            .ok_or_else(|| EvidenceError::Unreadable(local.path.display().to_string()))
    }

    async fn cleanup(&self, _local: LocalEvidence) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn evidence() -> EvidenceRef {
    EvidenceRef {
        id: "ev-1".to_string(),
        name: "policy.md".to_string(),
        location: PathBuf::from("/evidence/policy.md"),
    }
}
