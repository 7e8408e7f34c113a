//! Service wiring.

pub mod container;

pub use container::{ActiveReconciliation, JobSummary, ReconcileFailure, ServiceContainer};
