//! Control group resolution.
//!
//! Frameworks encode hierarchy differently: an explicit parent pointer, a
//! shared category label, or numeric nesting ("3" → "3.1"). The resolver runs
//! one lookup per encoding concurrently and picks the first usable result in
//! priority order parent link > category > prefix.

use crate::models::{Control, ControlSet, MatchStrategy};
use crate::store::{ControlFilter, DataStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A strategy's lookup result awaiting selection.
struct Candidate {
    strategy: MatchStrategy,
    controls: Vec<Control>,
    /// Fewest matches for the candidate to count.
    min_matches: usize,
}

impl Candidate {
    fn accept(self) -> Option<ControlSet> {
        if self.controls.len() >= self.min_matches {
            Some(ControlSet {
                strategy: self.strategy,
                controls: self.controls,
            })
        } else {
            None
        }
    }
}

/// Resolves a reference control into the group of controls to analyze.
#[derive(Clone)]
pub struct ControlResolver {
    store: Arc<dyn DataStore>,
}

impl ControlResolver {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Resolve the control group for `reference`.
    ///
    /// Returns `MatchStrategy::None` with an empty list when no strategy matches.
    pub async fn resolve(&self, reference: &Control) -> ControlSet {
        let (parent, category, prefix) = futures::join!(
            self.lookup(MatchStrategy::ParentLink, parent_filter(reference)),
            self.lookup(MatchStrategy::Category, category_filter(reference)),
            self.lookup(MatchStrategy::Prefix, prefix_filter(reference)),
        );

        if !category.is_empty() && !category.iter().any(|c| c.id == reference.id) {
            warn!(
                "Category matches for control {} do not include the control itself",
                reference.number
            );
        }

        let candidates = vec![
            Candidate {
                strategy: MatchStrategy::ParentLink,
                controls: parent,
                min_matches: 1,
            },
            // The reference shares its own category, so one match is only itself.
            Candidate {
                strategy: MatchStrategy::Category,
                controls: category,
                min_matches: 2,
            },
            Candidate {
                strategy: MatchStrategy::Prefix,
                controls: prefix,
                min_matches: 1,
            },
        ];

        let set = select(candidates);
        info!(
            "Resolved control {} via {} ({} controls)",
            reference.number,
            set.strategy,
            set.controls.len()
        );
        set
    }

    /// Run one lookup; a store error counts as no matches for that strategy only.
    async fn lookup(&self, strategy: MatchStrategy, filter: ControlFilter) -> Vec<Control> {
        match self.store.select_controls(&filter).await {
            Ok(controls) => {
                debug!("Strategy {} found {} controls", strategy, controls.len());
                controls
            }
            Err(e) => {
                warn!("Strategy {} lookup failed: {}", strategy, e);
                Vec::new()
            }
        }
    }
}

/// First accepted candidate in list order, or `none`.
fn select(candidates: Vec<Candidate>) -> ControlSet {
    candidates
        .into_iter()
        .find_map(Candidate::accept)
        .unwrap_or_else(ControlSet::none)
}

fn parent_filter(reference: &Control) -> ControlFilter {
    ControlFilter::ParentRef {
        framework_id: reference.framework_id.clone(),
        parent_number: reference.number.clone(),
    }
}

fn category_filter(reference: &Control) -> ControlFilter {
    let mut labels: Vec<String> = Vec::new();
    for label in [
        reference.category.as_deref(),
        Some(reference.number.as_str()),
        Some(reference.title.as_str()),
    ]
    .into_iter()
    .flatten()
    {
        if !label.is_empty() && !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }

    ControlFilter::Category {
        framework_id: reference.framework_id.clone(),
        labels,
    }
}

fn prefix_filter(reference: &Control) -> ControlFilter {
    ControlFilter::NumberPrefix {
        framework_id: reference.framework_id.clone(),
        prefix: format!("{}.", reference.number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use crate::testing::control;
    use async_trait::async_trait;

    fn with_parent(number: &str, parent: &str) -> Control {
        let mut c = control(number);
        c.parent_ref = Some(parent.to_string());
        c
    }

    fn with_category(number: &str, category: &str) -> Control {
        let mut c = control(number);
        c.category = Some(category.to_string());
        c
    }

    fn resolver(controls: Vec<Control>) -> ControlResolver {
        ControlResolver::new(Arc::new(MemoryStore::new(controls)))
    }

    #[tokio::test]
    async fn test_parent_link_takes_priority_over_category() {
        let reference = with_category("A.5", "Organizational");
        let controls = vec![
            reference.clone(),
            with_parent("A.5.1", "A.5"),
            with_category("A.6", "Organizational"),
        ];

        let set = resolver(controls).resolve(&reference).await;
        assert_eq!(set.strategy, MatchStrategy::ParentLink);
        assert_eq!(set.controls.len(), 1);
        assert_eq!(set.controls[0].number, "A.5.1");
    }

    #[tokio::test]
    async fn test_category_requires_a_peer() {
        let reference = with_category("7", "Physical");
        let lonely = resolver(vec![reference.clone()]).resolve(&reference).await;
        assert_eq!(lonely.strategy, MatchStrategy::None);

        let grouped = resolver(vec![reference.clone(), with_category("8", "Physical")])
            .resolve(&reference)
            .await;
        assert_eq!(grouped.strategy, MatchStrategy::Category);
        assert_eq!(grouped.controls.len(), 2);
    }

    #[tokio::test]
    async fn test_category_matches_reference_number() {
        // Grouped layout: children carry the parent's number as their category.
        let reference = control("CC6");
        let controls = vec![
            reference.clone(),
            with_category("CC6-a", "CC6"),
            with_category("CC6-b", "CC6"),
        ];

        let set = resolver(controls).resolve(&reference).await;
        assert_eq!(set.strategy, MatchStrategy::Category);
        assert_eq!(set.controls.len(), 2);
    }

    #[tokio::test]
    async fn test_category_matches_reference_title() {
        // Children name their group by the parent's title.
        let mut reference = control("AC");
        reference.title = "Access Control".to_string();
        let controls = vec![
            reference.clone(),
            with_category("AC-2", "Access Control"),
            with_category("AC-3", "Access Control"),
            with_category("AU-2", "Audit"),
        ];

        let set = resolver(controls).resolve(&reference).await;
        assert_eq!(set.strategy, MatchStrategy::Category);
        let numbers: Vec<&str> = set.controls.iter().map(|c| c.number.as_str()).collect();
        assert_eq!(numbers, vec!["AC-2", "AC-3"]);
    }

    #[tokio::test]
    async fn test_prefix_children_only() {
        let reference = control("3");
        let controls = vec![
            reference.clone(),
            control("3.1"),
            control("3.2"),
            control("30"),
            control("4.1"),
        ];

        let set = resolver(controls).resolve(&reference).await;
        assert_eq!(set.strategy, MatchStrategy::Prefix);
        let numbers: Vec<&str> = set.controls.iter().map(|c| c.number.as_str()).collect();
        assert_eq!(numbers, vec!["3.1", "3.2"]);
    }

    #[tokio::test]
    async fn test_no_match_returns_none() {
        let reference = control("9");
        let set = resolver(vec![reference.clone(), control("10")])
            .resolve(&reference)
            .await;
        assert_eq!(set.strategy, MatchStrategy::None);
        assert!(set.is_empty());
    }

    /// Store whose parent-link query always fails.
    struct FlakyParentStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DataStore for FlakyParentStore {
        async fn select_controls(
            &self,
            filter: &ControlFilter,
        ) -> Result<Vec<Control>, StoreError> {
            match filter {
                ControlFilter::ParentRef { .. } => {
                    Err(StoreError::Query("connection reset".to_string()))
                }
                _ => self.inner.select_controls(filter).await,
            }
        }

        async fn insert_result(
            &self,
            record: &crate::models::AnalysisRecord,
        ) -> Result<String, StoreError> {
            self.inner.insert_result(record).await
        }
    }

    #[tokio::test]
    async fn test_store_error_only_drops_that_strategy() {
        let reference = control("3");
        let store = FlakyParentStore {
            inner: MemoryStore::new(vec![
                reference.clone(),
                with_parent("3.1", "3"),
                control("3.2"),
            ]),
        };

        let set = ControlResolver::new(Arc::new(store)).resolve(&reference).await;
        assert_eq!(set.strategy, MatchStrategy::Prefix);
        assert_eq!(set.controls.len(), 2);
    }
}
