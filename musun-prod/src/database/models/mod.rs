//! Database models.
//!
//! These map one-to-one onto the `datasets`, `ProductionJobs` and
//! `ProductionRuns` tables.

pub mod dataset;
pub mod job;
pub mod run;

pub use dataset::*;
pub use job::*;
pub use run::*;
