//! Markdown report generation.
//!
//! This module renders a completed group analysis as a Markdown audit
//! report, or as pretty-printed JSON.

use crate::analysis::{count_by_status, weakest_controls};
use crate::config::ReportConfig;
use crate::models::{
    Aggregate, ComplianceStatus, ControlOutcome, GroupAnalysisResult, JobMetadata, OutcomeStatus,
};
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(
    result: &GroupAnalysisResult,
    model: &str,
    config: &ReportConfig,
) -> String {
    let mut output = String::new();

    output.push_str("# EvidAudit Report\n\n");

    output.push_str(&generate_metadata_section(&result.metadata, model));
    output.push_str(&generate_summary_section(&result.aggregate, &result.outcomes));

    if config.weakest_controls > 0 {
        output.push_str(&generate_weakest_section(
            &result.outcomes,
            config.weakest_controls,
        ));
    }

    output.push_str(&generate_results_section(
        &result.outcomes,
        config.include_summaries,
    ));
    output.push_str(&generate_errors_section(&result.outcomes));

    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &JobMetadata, model: &str) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Evidence:** {} (`{}`)\n",
        metadata.evidence_name, metadata.evidence_id
    ));
    section.push_str(&format!(
        "- **Reference Control:** {}\n",
        metadata.reference_control
    ));
    section.push_str(&format!("- **Match Strategy:** `{}`\n", metadata.strategy));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", model));
    section.push_str(&format!("- **Batches:** {}\n", metadata.batches));
    section.push_str(&format!(
        "- **Tokens:** {} ({} prompt, {} completion)\n",
        metadata.usage.total(),
        metadata.usage.prompt_tokens,
        metadata.usage.completion_tokens
    ));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

/// Generate the summary section.
fn generate_summary_section(aggregate: &Aggregate, outcomes: &[ControlOutcome]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str(&format!(
        "**Overall status:** {} {}\n\n",
        aggregate.overall_status.emoji(),
        aggregate.overall_status
    ));

    section.push_str(&format!(
        "| {} Compliant | {} Partial | {} Non-compliant | ⚠️ Errors | **Total** |\n",
        ComplianceStatus::Compliant.emoji(),
        ComplianceStatus::Partial.emoji(),
        ComplianceStatus::NonCompliant.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | **{}** |\n\n",
        aggregate.compliant,
        aggregate.partial,
        aggregate.non_compliant,
        aggregate.errors,
        aggregate.total
    ));

    let errors = count_by_status(outcomes)
        .get(&OutcomeStatus::Error)
        .copied()
        .unwrap_or(0);
    let analyzed = outcomes.len().saturating_sub(errors);
    section.push_str(&format!(
        "Average compliance: **{:.2}** / 100, average confidence: **{:.2}** / 100 ({} analyzed controls)\n\n",
        aggregate.average_compliance, aggregate.average_confidence, analyzed
    ));

    section
}

/// Generate the weakest controls section.
fn generate_weakest_section(outcomes: &[ControlOutcome], n: usize) -> String {
    let weakest = weakest_controls(outcomes, n);
    if weakest.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("### Weakest Controls\n\n");
    section.push_str("| Control | Title | Status | Score |\n");
    section.push_str("|:---|:---|:---:|:---:|\n");

    for outcome in weakest {
        let control = outcome.control();
        if let ControlOutcome::Analyzed(analyzed) = outcome {
            section.push_str(&format!(
                "| {} | {} | {} {} | {:.0} |\n",
                control.number,
                control.title,
                analyzed.status.emoji(),
                analyzed.status,
                analyzed.compliance_score
            ));
        }
    }
    section.push('\n');

    section
}

/// Generate the per-control results section.
fn generate_results_section(outcomes: &[ControlOutcome], include_summaries: bool) -> String {
    let mut section = String::new();

    section.push_str("## Results by Control\n\n");

    let analyzed: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            ControlOutcome::Analyzed(a) => Some(a),
            ControlOutcome::Failed(_) => None,
        })
        .collect();

    if analyzed.is_empty() {
        section.push_str("No control could be analyzed.\n\n");
        return section;
    }

    for control in analyzed {
        section.push_str(&format!(
            "### {} {} - {}\n\n",
            control.status.emoji(),
            control.control.number,
            control.control.title
        ));
        section.push_str(&format!(
            "*Status: {} | Compliance: {:.0} | Confidence: {:.0}*\n\n",
            control.status, control.compliance_score, control.confidence_score
        ));

        if include_summaries && !control.summary.is_empty() {
            section.push_str(&format!("> {}\n\n", control.summary));
        }
    }

    section
}

/// Generate the errors section. Empty when every control was analyzed.
fn generate_errors_section(outcomes: &[ControlOutcome]) -> String {
    let failed: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            ControlOutcome::Failed(f) => Some(f),
            ControlOutcome::Analyzed(_) => None,
        })
        .collect();

    if failed.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Errors\n\n");
    section.push_str("| Control | Title | Error |\n");
    section.push_str("|:---|:---|:---|\n");
    for f in failed {
        section.push_str(&format!(
            "| {} | {} | {} |\n",
            f.control.number,
            f.control.title,
            f.error.replace('|', "\\|").replace('\n', " ")
        ));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by EvidAudit v{}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(result: &GroupAnalysisResult) -> Result<String> {
    serde_json::to_string_pretty(result).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregate;
    use crate::models::{
        AnalyzedControl, ControlRef, FailedControl, MatchStrategy, TokenUsage,
    };
    use chrono::Utc;

    fn control_ref(number: &str, title: &str) -> ControlRef {
        ControlRef {
            control_id: format!("id-{}", number),
            number: number.to_string(),
            title: title.to_string(),
        }
    }

    fn analyzed(number: &str, status: ComplianceStatus, score: f64) -> ControlOutcome {
        ControlOutcome::Analyzed(AnalyzedControl {
            control: control_ref(number, "Access review"),
            status,
            compliance_score: score,
            confidence_score: 90.0,
            summary: format!("Summary for {}", number),
            result_id: Some(format!("r-{}", number)),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
            },
        })
    }

    fn create_test_result() -> GroupAnalysisResult {
        let outcomes = vec![
            analyzed("3.1", ComplianceStatus::Compliant, 95.0),
            analyzed("3.2", ComplianceStatus::NonCompliant, 10.0),
            ControlOutcome::Failed(FailedControl {
                control: control_ref("3.3", "Key rotation"),
                status: OutcomeStatus::Error,
                error: "rate limited: retries exhausted after 4 attempts: 429".to_string(),
            }),
        ];
        let now = Utc::now();

        GroupAnalysisResult {
            aggregate: aggregate(&outcomes),
            outcomes,
            metadata: JobMetadata {
                evidence_id: "ev-1".to_string(),
                evidence_name: "policy.md".to_string(),
                reference_control: "3".to_string(),
                strategy: MatchStrategy::Prefix,
                batches: 1,
                usage: TokenUsage {
                    prompt_tokens: 200,
                    completion_tokens: 40,
                },
                started_at: now,
                completed_at: now,
                duration_seconds: 4.2,
            },
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let result = create_test_result();
        let markdown = generate_markdown_report(&result, "test-model", &ReportConfig::default());

        assert!(markdown.contains("# EvidAudit Report"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("## Summary"));
        assert!(markdown.contains("## Results by Control"));
        assert!(markdown.contains("### Weakest Controls"));
        assert!(markdown.contains("## Errors"));
        assert!(markdown.contains("Summary for 3.2"));
        assert!(markdown.contains("Key rotation"));
        assert!(markdown.contains("**Overall status:** 🔴 Non-compliant"));
    }

    #[test]
    fn test_summaries_can_be_omitted() {
        let result = create_test_result();
        let config = ReportConfig {
            include_summaries: false,
            weakest_controls: 0,
        };
        let markdown = generate_markdown_report(&result, "test-model", &config);

        assert!(!markdown.contains("Summary for 3.1"));
        assert!(!markdown.contains("Weakest Controls"));
    }

    #[test]
    fn test_generate_metadata_section() {
        let result = create_test_result();
        let section = generate_metadata_section(&result.metadata, "test-model");

        assert!(section.contains("policy.md"));
        assert!(section.contains("`prefix`"));
        assert!(section.contains("test-model"));
        assert!(section.contains("240 (200 prompt, 40 completion)"));
    }

    #[test]
    fn test_weakest_section_lists_lowest_first() {
        let result = create_test_result();
        let section = generate_weakest_section(&result.outcomes, 5);

        let low = section.find("3.2").unwrap();
        let high = section.find("3.1").unwrap();
        assert!(low < high);
        assert!(!section.contains("3.3"));
    }

    #[test]
    fn test_errors_section_empty_without_failures() {
        let outcomes = vec![analyzed("1", ComplianceStatus::Compliant, 100.0)];
        assert!(generate_errors_section(&outcomes).is_empty());
    }

    #[test]
    fn test_generate_json_report() {
        let result = create_test_result();
        let json = generate_json_report(&result).unwrap();

        assert!(json.contains("\"aggregate\""));
        assert!(json.contains("\"outcomes\""));
        assert!(json.contains("\"outcome\": \"failed\""));
        assert!(json.contains("\"strategy\": \"prefix\""));
    }
}
