//! Job tracking for background group analyses.

pub mod store;

pub use store::{JobStore, JobStoreConfig};
