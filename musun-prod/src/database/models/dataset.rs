//! Dataset database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A named collection of input runs living under one filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DatasetDbModel {
    pub name: String,
    pub path: String,
}

impl DatasetDbModel {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Result of registering a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// Already registered with the same path.
    Unchanged,
}
