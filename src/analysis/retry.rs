//! Per-control analysis with rate-limit retries.
//!
//! [`RetryingAnalyzer`] performs one analysis for a (control, evidence) pair,
//! persists the result and always resolves to a [`ControlOutcome`]. Rate-limit
//! failures are retried on a fixed, escalating delay table; any other failure
//! ends the attempt immediately.

use crate::analysis::engine::{AnalysisEngine, AnalysisError};
use crate::evidence::EvidenceContent;
use crate::models::{
    AnalysisContext, AnalysisRecord, AnalysisResponse, AnalyzedControl, ComparisonArtifact,
    Control, ControlOutcome,
};
use crate::store::DataStore;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Characters of evidence text kept in the comparison artifact.
const EXCERPT_CHARS: usize = 500;

/// Decides whether an engine error is a rate-limit signal.
pub type RateLimitPredicate = Arc<dyn Fn(&AnalysisError) -> bool + Send + Sync>;

/// Escalating retry schedule for rate-limited calls.
#[derive(Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    is_rate_limited: RateLimitPredicate,
}

impl RetryPolicy {
    /// Policy with the given delay table and the default predicate
    /// (`AnalysisError::RateLimited`).
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            is_rate_limited: Arc::new(|e| matches!(e, AnalysisError::RateLimited(_))),
        }
    }

    pub fn from_secs(delays: &[u64]) -> Self {
        Self::new(delays.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    /// Replace the rate-limit predicate.
    #[allow(dead_code)] // For engines that signal throttling through other errors
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AnalysisError) -> bool + Send + Sync + 'static,
    {
        self.is_rate_limited = Arc::new(predicate);
        self
    }

    /// Delay before retry number `retry` (0-based), if the table has one.
    pub fn delay_for(&self, retry: usize) -> Option<Duration> {
        self.delays.get(retry).copied()
    }

    /// Total attempts: the first call plus one per delay step.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn is_rate_limited(&self, error: &AnalysisError) -> bool {
        (self.is_rate_limited)(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&[30, 60, 120])
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("delays", &self.delays)
            .finish_non_exhaustive()
    }
}

/// Runs one control analysis with retries and persistence.
#[derive(Clone)]
pub struct RetryingAnalyzer {
    engine: Arc<dyn AnalysisEngine>,
    store: Arc<dyn DataStore>,
    policy: RetryPolicy,
}

impl RetryingAnalyzer {
    pub fn new(
        engine: Arc<dyn AnalysisEngine>,
        store: Arc<dyn DataStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            store,
            policy,
        }
    }

    /// Analyze `control` against the evidence. Never fails: every error path
    /// becomes a failed outcome.
    pub async fn analyze(
        &self,
        control: &Control,
        content: &EvidenceContent,
        context: &AnalysisContext,
    ) -> ControlOutcome {
        let response = match self.call_with_retry(control, content, context).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Analysis of control {} failed: {}", control.number, e);
                return ControlOutcome::error(control, e.to_string());
            }
        };

        let record = AnalysisRecord {
            evidence_id: context.evidence_id.clone(),
            control_id: control.id.clone(),
            status: response.status,
            compliance_score: response.compliance_score,
            confidence_score: response.confidence_score,
            summary: response.summary.clone(),
            comparison: build_comparison(control, content, &response),
            usage: response.usage,
            analyzed_at: Utc::now(),
        };

        let result_id = match self.store.insert_result(&record).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    "Failed to persist result for control {}: {}",
                    control.number, e
                );
                None
            }
        };

        ControlOutcome::Analyzed(AnalyzedControl {
            control: control.as_ref_record(),
            status: response.status,
            compliance_score: response.compliance_score,
            confidence_score: response.confidence_score,
            summary: response.summary,
            result_id,
            usage: response.usage,
        })
    }

    async fn call_with_retry(
        &self,
        control: &Control,
        content: &EvidenceContent,
        context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError> {
        let mut retry = 0;

        loop {
            match self.call_once(control, content, context).await {
                Ok(response) => {
                    if retry > 0 {
                        info!(
                            "Control {} succeeded after {} rate-limit retries",
                            control.number, retry
                        );
                    }
                    return Ok(response);
                }
                Err(e) if self.policy.is_rate_limited(&e) => match self.policy.delay_for(retry) {
                    Some(delay) => {
                        warn!(
                            "Rate limited on control {} (attempt {}/{}), retrying in {}s",
                            control.number,
                            retry + 1,
                            self.policy.max_attempts(),
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    None => {
                        return Err(AnalysisError::RateLimited(format!(
                            "retries exhausted after {} attempts: {}",
                            retry + 1,
                            rate_limit_message(&e)
                        )));
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(
        &self,
        control: &Control,
        content: &EvidenceContent,
        context: &AnalysisContext,
    ) -> Result<AnalysisResponse, AnalysisError> {
        debug!("Analyzing control {}", control.number);
        match content {
            EvidenceContent::Text(text) => self.engine.analyze_text(text, control, context).await,
            EvidenceContent::Image { data, media_type } => {
                self.engine
                    .analyze_image(data, media_type, control, context)
                    .await
            }
        }
    }
}

fn rate_limit_message(error: &AnalysisError) -> String {
    match error {
        AnalysisError::RateLimited(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Derive the comparison artifact stored next to a result.
fn build_comparison(
    control: &Control,
    content: &EvidenceContent,
    response: &AnalysisResponse,
) -> ComparisonArtifact {
    ComparisonArtifact {
        control_number: control.number.clone(),
        requirement: if control.requirement.is_empty() {
            control.title.clone()
        } else {
            control.requirement.clone()
        },
        evidence_excerpt: content.excerpt(EXCERPT_CHARS),
        verdict: response.status,
        compliance_score: response.compliance_score,
        summary: response.summary.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComplianceStatus, OutcomeStatus};
    use crate::store::MemoryStore;
    use crate::testing::{context, control, response, FailingStore, ScriptedEngine};
    use tokio::time::Instant;

    fn text() -> EvidenceContent {
        EvidenceContent::Text("Access reviews are performed quarterly.".to_string())
    }

    fn rate_limited(msg: &str) -> Result<AnalysisResponse, AnalysisError> {
        Err(AnalysisError::RateLimited(msg.to_string()))
    }

    #[test]
    fn test_policy_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(120)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_two_rate_limits() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            rate_limited("slow down"),
            rate_limited("slow down"),
            Ok(response(ComplianceStatus::Compliant, 90.0)),
        ]));
        let store = Arc::new(MemoryStore::new(vec![]));
        let analyzer = RetryingAnalyzer::new(engine.clone(), store.clone(), RetryPolicy::default());

        let start = Instant::now();
        let outcome = analyzer.analyze(&control("1.1"), &text(), &context()).await;

        assert_eq!(engine.calls(), 3);
        // Exactly the first two delay steps were waited.
        assert_eq!(start.elapsed(), Duration::from_secs(30 + 60));

        // Same shape as a first-try success.
        let first_try_engine = Arc::new(ScriptedEngine::new(vec![Ok(response(
            ComplianceStatus::Compliant,
            90.0,
        ))]));
        let first_try =
            RetryingAnalyzer::new(first_try_engine, store.clone(), RetryPolicy::default())
                .analyze(&control("1.1"), &text(), &context())
                .await;
        assert_eq!(outcome, first_try);
        assert_eq!(outcome.status(), OutcomeStatus::Compliant);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            rate_limited("quota 1"),
            rate_limited("quota 2"),
            rate_limited("quota 3"),
            rate_limited("quota 4"),
            Ok(response(ComplianceStatus::Compliant, 90.0)),
        ]));
        let store = Arc::new(MemoryStore::new(vec![]));
        let analyzer = RetryingAnalyzer::new(engine.clone(), store.clone(), RetryPolicy::default());

        let start = Instant::now();
        let outcome = analyzer.analyze(&control("1.1"), &text(), &context()).await;

        assert_eq!(engine.calls(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(30 + 60 + 120));
        match outcome {
            ControlOutcome::Failed(failed) => {
                assert!(failed.error.contains("quota 4"), "got {}", failed.error);
                assert_eq!(failed.control.number, "1.1");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(store.results().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rate_limit_error_not_retried() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Err(AnalysisError::Api {
                status: 500,
                body: "model crashed".to_string(),
            }),
            Ok(response(ComplianceStatus::Compliant, 90.0)),
        ]));
        let analyzer = RetryingAnalyzer::new(
            engine.clone(),
            Arc::new(MemoryStore::new(vec![])),
            RetryPolicy::default(),
        );

        let start = Instant::now();
        let outcome = analyzer.analyze(&control("1.1"), &text(), &context()).await;

        assert_eq!(engine.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(outcome.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        // Treat HTTP 503 as a rate-limit signal.
        let policy = RetryPolicy::from_secs(&[5]).with_predicate(|e| {
            matches!(e, AnalysisError::Api { status: 503, .. })
        });
        let engine = Arc::new(ScriptedEngine::new(vec![
            Err(AnalysisError::Api {
                status: 503,
                body: "overloaded".to_string(),
            }),
            Ok(response(ComplianceStatus::Partial, 50.0)),
        ]));
        let analyzer =
            RetryingAnalyzer::new(engine.clone(), Arc::new(MemoryStore::new(vec![])), policy);

        let outcome = analyzer.analyze(&control("1.1"), &text(), &context()).await;
        assert_eq!(engine.calls(), 2);
        assert_eq!(outcome.status(), OutcomeStatus::Partial);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_success() {
        let engine = Arc::new(ScriptedEngine::new(vec![Ok(response(
            ComplianceStatus::NonCompliant,
            15.0,
        ))]));
        let analyzer =
            RetryingAnalyzer::new(engine, Arc::new(FailingStore), RetryPolicy::default());

        let outcome = analyzer.analyze(&control("2.3"), &text(), &context()).await;
        match outcome {
            ControlOutcome::Analyzed(analyzed) => {
                assert_eq!(analyzed.status, ComplianceStatus::NonCompliant);
                assert!(analyzed.result_id.is_none());
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persists_comparison_artifact() {
        let engine = Arc::new(ScriptedEngine::new(vec![Ok(response(
            ComplianceStatus::Compliant,
            95.0,
        ))]));
        let store = Arc::new(MemoryStore::new(vec![]));
        let analyzer = RetryingAnalyzer::new(engine, store.clone(), RetryPolicy::default());

        let outcome = analyzer.analyze(&control("4.2"), &text(), &context()).await;

        let rows = store.results();
        assert_eq!(rows.len(), 1);
        let (id, record) = &rows[0];
        assert_eq!(record.control_id, "id-4.2");
        assert_eq!(record.comparison.control_number, "4.2");
        assert!(record.comparison.evidence_excerpt.contains("quarterly"));
        match outcome {
            ControlOutcome::Analyzed(analyzed) => assert_eq!(analyzed.result_id.as_ref(), Some(id)),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_image_evidence_uses_image_variant() {
        let engine = Arc::new(ScriptedEngine::new(vec![Ok(response(
            ComplianceStatus::Compliant,
            70.0,
        ))]));
        let analyzer = RetryingAnalyzer::new(
            engine.clone(),
            Arc::new(MemoryStore::new(vec![])),
            RetryPolicy::default(),
        );

        let image = EvidenceContent::Image {
            data: vec![0x89, 0x50, 0x4e, 0x47],
            media_type: "image/png".to_string(),
        };
        let outcome = analyzer.analyze(&control("1.1"), &image, &context()).await;

        assert_eq!(engine.image_calls(), 1);
        assert_eq!(outcome.status(), OutcomeStatus::Compliant);
    }
}
