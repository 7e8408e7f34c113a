//! musun-prod library crate.
//!
//! Tracks MuSun production processing: which runs of a dataset have been
//! handed to which batch job, and what each job reported back.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod production;
pub mod services;
pub mod utils;

pub use config::{DataType, TrackerConfig};
pub use error::{Error, Result};
pub use services::ServiceContainer;
