//! Outcome aggregation and statistics.
//!
//! This module folds the per-control outcomes of a group analysis into
//! summary statistics. Everything here is pure.

use crate::models::{Aggregate, ComplianceStatus, ControlOutcome, OutcomeStatus};
use std::collections::HashMap;

/// Aggregate per-control outcomes into group statistics.
///
/// Error outcomes count towards `total` and `errors` but are excluded from the
/// averages. An empty list yields `partial` with zeroed averages.
pub fn aggregate(outcomes: &[ControlOutcome]) -> Aggregate {
    let mut stats = Aggregate {
        total: outcomes.len(),
        compliant: 0,
        partial: 0,
        non_compliant: 0,
        errors: 0,
        average_compliance: 0.0,
        average_confidence: 0.0,
        overall_status: ComplianceStatus::Partial,
    };

    let mut compliance_sum = 0.0;
    let mut confidence_sum = 0.0;
    let mut scored = 0usize;

    for outcome in outcomes {
        match outcome {
            ControlOutcome::Analyzed(analyzed) => {
                match analyzed.status {
                    ComplianceStatus::Compliant => stats.compliant += 1,
                    ComplianceStatus::Partial => stats.partial += 1,
                    ComplianceStatus::NonCompliant => stats.non_compliant += 1,
                }
                compliance_sum += analyzed.compliance_score;
                confidence_sum += analyzed.confidence_score;
                scored += 1;
            }
            ControlOutcome::Failed(_) => stats.errors += 1,
        }
    }

    if scored > 0 {
        stats.average_compliance = round_score(compliance_sum / scored as f64);
        stats.average_confidence = round_score(confidence_sum / scored as f64);
    }

    stats.overall_status = overall_status(&stats);
    stats
}

/// Derive the group verdict from the counters.
fn overall_status(stats: &Aggregate) -> ComplianceStatus {
    if stats.non_compliant > 0 {
        ComplianceStatus::NonCompliant
    } else if stats.total > 0 && stats.compliant == stats.total {
        ComplianceStatus::Compliant
    } else {
        ComplianceStatus::Partial
    }
}

fn round_score(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Count outcomes by status.
pub fn count_by_status(outcomes: &[ControlOutcome]) -> HashMap<OutcomeStatus, usize> {
    let mut counts: HashMap<OutcomeStatus, usize> = HashMap::new();

    for outcome in outcomes {
        *counts.entry(outcome.status()).or_default() += 1;
    }

    counts
}

/// Controls with the lowest compliance scores (errors excluded).
pub fn weakest_controls(outcomes: &[ControlOutcome], n: usize) -> Vec<&ControlOutcome> {
    let mut scored: Vec<(&ControlOutcome, f64)> = outcomes
        .iter()
        .filter_map(|o| match o {
            ControlOutcome::Analyzed(a) => Some((o, a.compliance_score)),
            ControlOutcome::Failed(_) => None,
        })
        .collect();

    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(n);

    scored.into_iter().map(|(o, _)| o).collect()
}

/// Generate a text summary of the aggregate.
pub fn generate_summary_text(stats: &Aggregate) -> String {
    let mut lines = Vec::new();

    lines.push(format!(
        "Overall: {} {}",
        stats.overall_status.emoji(),
        stats.overall_status
    ));
    lines.push(format!("Controls: {}", stats.total));
    lines.push(format!(
        "- {} Compliant: {}",
        ComplianceStatus::Compliant.emoji(),
        stats.compliant
    ));
    lines.push(format!(
        "- {} Partial: {}",
        ComplianceStatus::Partial.emoji(),
        stats.partial
    ));
    lines.push(format!(
        "- {} Non-compliant: {}",
        ComplianceStatus::NonCompliant.emoji(),
        stats.non_compliant
    ));
    if stats.errors > 0 {
        lines.push(format!("- ⚠️ Errors: {}", stats.errors));
    }
    lines.push(format!(
        "Average compliance: {:.1}% (confidence {:.1}%)",
        stats.average_compliance, stats.average_confidence
    ));

    lines.join("\n")
}
