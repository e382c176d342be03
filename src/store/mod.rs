//! Data store access for controls and analysis results.
//!
//! The [`DataStore`] trait is the boundary to the relational store. The
//! bundled [`MemoryStore`] serves a control catalog loaded from JSON and
//! keeps result rows in memory.

use crate::models::{AnalysisRecord, Control};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Errors raised by a data store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Selection criteria for control lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFilter {
    /// Controls whose parent reference equals `parent_number`.
    ParentRef {
        framework_id: String,
        parent_number: String,
    },
    /// Controls whose category equals any of `labels`.
    Category {
        framework_id: String,
        labels: Vec<String>,
    },
    /// Controls whose number starts with `prefix`.
    NumberPrefix {
        framework_id: String,
        prefix: String,
    },
}

impl ControlFilter {
    fn framework_id(&self) -> &str {
        match self {
            ControlFilter::ParentRef { framework_id, .. }
            | ControlFilter::Category { framework_id, .. }
            | ControlFilter::NumberPrefix { framework_id, .. } => framework_id,
        }
    }

    /// Whether `control` satisfies this filter.
    pub fn matches(&self, control: &Control) -> bool {
        if control.framework_id != self.framework_id() {
            return false;
        }

        match self {
            ControlFilter::ParentRef { parent_number, .. } => {
                control.parent_ref.as_deref() == Some(parent_number.as_str())
            }
            ControlFilter::Category { labels, .. } => control
                .category
                .as_deref()
                .map(|c| labels.iter().any(|l| l == c))
                .unwrap_or(false),
            ControlFilter::NumberPrefix { prefix, .. } => {
                control.number.starts_with(prefix.as_str())
            }
        }
    }
}

/// Boundary to the persistent store.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Select controls matching `filter`, in catalog order.
    async fn select_controls(&self, filter: &ControlFilter) -> Result<Vec<Control>, StoreError>;

    /// Persist an analysis result and return its row identifier.
    async fn insert_result(&self, record: &AnalysisRecord) -> Result<String, StoreError>;
}

/// In-memory store over a control catalog.
///
/// Result rows are keyed by (evidence, control); re-analysis overwrites the
/// previous row and keeps its identifier.
pub struct MemoryStore {
    controls: Vec<Control>,
    results: Mutex<HashMap<(String, String), (String, AnalysisRecord)>>,
}

impl MemoryStore {
    pub fn new(controls: Vec<Control>) -> Self {
        Self {
            controls,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Load a control catalog from a JSON array of control records.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read control catalog: {}", path.display()))?;

        let controls: Vec<Control> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse control catalog: {}", path.display()))?;

        info!("Loaded {} controls from {}", controls.len(), path.display());
        Ok(Self::new(controls))
    }

    /// Find a control by number, optionally scoped to a framework.
    pub fn find_control(&self, number: &str, framework_id: Option<&str>) -> Option<&Control> {
        self.controls.iter().find(|c| {
            c.number == number && framework_id.map(|f| f == c.framework_id).unwrap_or(true)
        })
    }

    /// Snapshot of stored result rows as (row id, record), sorted by control.
    pub fn results(&self) -> Vec<(String, AnalysisRecord)> {
        let guard = match self.results.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut rows: Vec<_> = guard.values().cloned().collect();
        rows.sort_by(|a, b| a.1.control_id.cmp(&b.1.control_id));
        rows
    }

    /// Write the stored result rows to a JSON file.
    pub fn export_results(&self, path: &Path) -> Result<usize> {
        let rows: Vec<serde_json::Value> = self
            .results()
            .into_iter()
            .map(|(id, record)| serde_json::json!({ "id": id, "record": record }))
            .collect();

        let json = serde_json::to_string_pretty(&rows).context("Failed to serialize results")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))?;

        Ok(rows.len())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn select_controls(&self, filter: &ControlFilter) -> Result<Vec<Control>, StoreError> {
        let matched: Vec<Control> = self
            .controls
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();

        debug!("Filter {:?} matched {} controls", filter, matched.len());
        Ok(matched)
    }

    async fn insert_result(&self, record: &AnalysisRecord) -> Result<String, StoreError> {
        let mut results = self.results.lock().map_err(|_| StoreError::Poisoned)?;

        let key = (record.evidence_id.clone(), record.control_id.clone());
        let id = results
            .get(&key)
            .map(|(id, _)| id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        results.insert(key, (id.clone(), record.clone()));
        Ok(id)
    }
}
