//! Stage executors for the five-stage workflow.
//!
//! Each executor computes its output, records provenance and persists the
//! output into the run checkpoint. Stage transitions belong to the graph.

pub mod analyze;
pub mod execute;
pub mod recommend;
pub mod review;
pub mod synthesize;

use std::sync::Arc;

use chrono::Utc;

use super::db::{DbHandle, OrchestrationDb};
use super::documents::DocumentStore;
use super::llm::LlmClients;
use super::provenance::ProvenanceRecorder;
use super::tools::ToolRunner;
use crate::config::ReviewPolicy;
use crate::errors::OrchestrationError;

/// Orchestration knobs taken from `[orchestration]` and `[tools]`.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub review_policy: ReviewPolicy,
    pub max_concurrent_documents: usize,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            review_policy: ReviewPolicy::AutoApprove,
            max_concurrent_documents: 4,
        }
    }
}

/// Collaborators shared by every stage of every run.
#[derive(Clone)]
pub struct StageContext {
    pub db: DbHandle,
    pub documents: Arc<dyn DocumentStore>,
    pub llm: LlmClients,
    pub tools: Arc<dyn ToolRunner>,
    pub provenance: ProvenanceRecorder,
    pub settings: StageSettings,
}

impl StageContext {
    pub fn new(
        db: DbHandle,
        documents: Arc<dyn DocumentStore>,
        llm: LlmClients,
        tools: Arc<dyn ToolRunner>,
        settings: StageSettings,
    ) -> Self {
        Self {
            provenance: ProvenanceRecorder::new(db.clone()),
            db,
            documents,
            llm,
            tools,
            settings,
        }
    }

    /// Database call with typed errors recovered from the `anyhow` chain.
    pub async fn db<F, R>(&self, f: F) -> Result<R, OrchestrationError>
    where
        F: FnOnce(&OrchestrationDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.db.call(f).await.map_err(OrchestrationError::from_db)
    }

    /// Progress updates are advisory; a failed write is logged, not raised.
    pub async fn report_progress(&self, run_id: &str, progress: u8) {
        let id = run_id.to_string();
        if let Err(e) = self.db.call(move |db| db.update_progress(&id, progress)).await {
            tracing::warn!(run_id = %run_id, progress, "failed to update progress: {:#}", e);
        }
    }
}

pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Linear interpolation of progress between two stage entry points.
pub(crate) fn interpolate(from: u8, to: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return from;
    }
    let span = to.saturating_sub(from) as usize;
    from + (span * done.min(total) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_bounds() {
        assert_eq!(interpolate(45, 90, 0, 4), 45);
        assert_eq!(interpolate(45, 90, 2, 4), 67);
        assert_eq!(interpolate(45, 90, 4, 4), 90);
        assert_eq!(interpolate(45, 90, 9, 4), 90);
        assert_eq!(interpolate(45, 90, 1, 0), 45);
    }
}
