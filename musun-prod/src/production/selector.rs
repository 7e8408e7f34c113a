//! Run selection.
//!
//! Selection is a read-only snapshot. Runs it returns may be claimed by
//! another submitter before this one commits; the submitter re-checks every
//! candidate inside its claiming transaction.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt, TryStreamExt};

use crate::Result;
use crate::database::models::RunCandidate;
use crate::database::repositories::RunRepository;

pub struct RunSelector {
    runs: Arc<dyn RunRepository>,
}

impl RunSelector {
    pub fn new(runs: Arc<dyn RunRepository>) -> Self {
        Self { runs }
    }

    /// All unclaimed runs of `dataset` in ascending run number, fetched lazily.
    pub fn candidates<'a>(&'a self, dataset: &'a str) -> BoxStream<'a, Result<RunCandidate>> {
        self.runs.stream_unclaimed(dataset)
    }

    /// Up to `count` unclaimed runs of `dataset`, lowest run numbers first.
    /// Returns fewer when fewer are available; callers check the length.
    pub async fn select_runs(&self, dataset: &str, count: usize) -> Result<Vec<RunCandidate>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.candidates(dataset).take(count).try_collect().await
    }
}
