//! Evidence analysis: engine boundary, retries, batch orchestration and
//! aggregation.

pub mod aggregator;
pub mod engine;
pub mod orchestrator;
pub mod retry;
pub mod service;

pub use aggregator::*;
pub use engine::{EngineConfig, OllamaEngine};
pub use orchestrator::{BatchOrchestrator, OrchestratorConfig};
pub use retry::{RetryPolicy, RetryingAnalyzer};
pub use service::GroupAnalysisService;
