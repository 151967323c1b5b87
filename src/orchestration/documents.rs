use async_trait::async_trait;

use super::db::DbHandle;
use super::models::ExperimentBundle;
use crate::errors::OrchestrationError;

/// Source of experiments and their documents for the Analyze stage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load_experiment(
        &self,
        experiment_id: i64,
    ) -> Result<ExperimentBundle, OrchestrationError>;
}

/// Reads experiments from the orchestrator's own SQLite database.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: DbHandle,
}

impl SqliteDocumentStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn load_experiment(
        &self,
        experiment_id: i64,
    ) -> Result<ExperimentBundle, OrchestrationError> {
        self.db
            .call(move |db| {
                let experiment = db
                    .get_experiment(experiment_id)?
                    .ok_or(OrchestrationError::ExperimentNotFound { id: experiment_id })?;
                let documents = db.list_documents(experiment_id)?;
                Ok(ExperimentBundle {
                    experiment,
                    documents,
                })
            })
            .await
            .map_err(OrchestrationError::from_db)
    }
}
