//! Repository layer for database access.
//!
//! Read-side queries live behind the `*Repository` traits. Multi-row
//! mutations that must commit together are exposed as transaction-scoped
//! primitives in [`production_tx`].

pub mod dataset;
pub mod job;
pub mod production_tx;
pub mod run;

pub use dataset::*;
pub use job::*;
pub use production_tx::*;
pub use run::*;
