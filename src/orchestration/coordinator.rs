use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::graph::{self, DriveOutcome};
use super::models::{OrchestrationRun, RunStatus, RunStatusView};
use super::provenance::ProvenanceBundle;
use super::stages::StageContext;
use super::stages::review::{self, ReviewRequest};
use crate::errors::OrchestrationError;

/// One async lock per run id. Whoever holds it is the run's only writer.
#[derive(Clone, Default)]
pub struct RunGuards {
    slots: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RunGuards {
    fn slot(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for the run to be free.
    pub async fn acquire(&self, run_id: &str) -> OwnedMutexGuard<()> {
        self.slot(run_id).lock_owned().await
    }

    /// Take the run only if nobody is driving it.
    pub fn try_acquire(&self, run_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(run_id).try_lock_owned().ok()
    }
}

/// Entry point for the HTTP layer: starts runs, accepts reviews, resumes
/// interrupted runs and answers status polls from durable state.
pub struct Coordinator {
    ctx: StageContext,
    guards: RunGuards,
    tasks: Arc<tokio::sync::Mutex<JoinSet<()>>>,
}

impl Coordinator {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            guards: RunGuards::default(),
            tasks: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
        }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Create a run and hand it to a background driver.
    pub async fn start_run(
        &self,
        experiment_id: i64,
        review_choices: bool,
    ) -> Result<OrchestrationRun, OrchestrationError> {
        let run_id = Uuid::new_v4().to_string();
        let id = run_id.clone();
        let run = self
            .ctx
            .db(move |db| {
                if db.get_experiment(experiment_id)?.is_none() {
                    return Err(OrchestrationError::ExperimentNotFound { id: experiment_id }.into());
                }
                db.create_run(&id, experiment_id, review_choices)
            })
            .await?;
        tracing::info!(run_id = %run_id, experiment_id, review_choices, "run started");
        self.spawn_driver(run_id, None).await;
        Ok(run)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatusView, OrchestrationError> {
        let id = run_id.to_string();
        let (run, checkpoint) = self
            .ctx
            .db(move |db| Ok((db.require_run(&id)?, db.load_checkpoint(&id)?)))
            .await?;
        Ok(RunStatusView::build(run, checkpoint, Utc::now()))
    }

    /// Record the run's review decision; an approval resumes the run.
    pub async fn submit_review(
        &self,
        run_id: &str,
        request: ReviewRequest,
    ) -> Result<OrchestrationRun, OrchestrationError> {
        let approved = request.approved;
        let run = review::submit(&self.ctx, run_id, request, false).await?;
        if approved {
            self.spawn_driver(run_id.to_string(), None).await;
        }
        Ok(run)
    }

    /// Re-drive a run whose driver died. Rejected while another driver holds it.
    pub async fn resume(&self, run_id: &str) -> Result<OrchestrationRun, OrchestrationError> {
        let id = run_id.to_string();
        let run = self.ctx.db(move |db| db.require_run(&id)).await?;
        let guard = self
            .guards
            .try_acquire(run_id)
            .ok_or_else(|| OrchestrationError::ResumeConflict {
                run_id: run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            tracing::info!(run_id = %run_id, status = %run.status.as_str(), "resume requested for finished run");
            return Ok(run);
        }
        tracing::info!(run_id = %run_id, stage = %run.current_stage, "resuming run");
        self.spawn_driver(run_id.to_string(), Some(guard)).await;
        Ok(run)
    }

    /// Re-drive every run left mid-flight by a previous process.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, OrchestrationError> {
        let mut runs = self
            .ctx
            .db(|db| db.list_runs_with_status(RunStatus::Running))
            .await?;
        // Policy-approved runs may have stopped between reaching reviewing
        // and recording the automatic decision.
        let parked = self
            .ctx
            .db(|db| db.list_runs_with_status(RunStatus::Reviewing))
            .await?;
        runs.extend(parked.into_iter().filter(|r| !r.review_choices));

        let mut resumed = Vec::with_capacity(runs.len());
        for run in runs {
            tracing::info!(run_id = %run.run_id, stage = %run.current_stage, "recovering interrupted run");
            self.spawn_driver(run.run_id.clone(), None).await;
            resumed.push(run.run_id);
        }
        Ok(resumed)
    }

    pub async fn run_provenance(&self, run_id: &str) -> Result<ProvenanceBundle, OrchestrationError> {
        let id = run_id.to_string();
        self.ctx
            .db(move |db| {
                db.require_run(&id)?;
                db.load_run_provenance(&id)
            })
            .await
    }

    pub async fn experiment_provenance(
        &self,
        experiment_id: i64,
    ) -> Result<ProvenanceBundle, OrchestrationError> {
        self.ctx
            .db(move |db| {
                if db.get_experiment(experiment_id)?.is_none() {
                    return Err(OrchestrationError::ExperimentNotFound { id: experiment_id }.into());
                }
                db.load_experiment_provenance(experiment_id)
            })
            .await
    }

    /// Abort every driver. Runs stay resumable from their checkpoints.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            tracing::info!(drivers = tasks.len(), "stopping run drivers");
        }
        tasks.shutdown().await;
    }

    async fn spawn_driver(&self, run_id: String, guard: Option<OwnedMutexGuard<()>>) {
        let ctx = self.ctx.clone();
        let guards = self.guards.clone();
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let _guard = match guard {
                Some(guard) => guard,
                None => guards.acquire(&run_id).await,
            };
            match graph::drive(&ctx, &run_id).await {
                DriveOutcome::Failed(message) => {
                    tracing::warn!(run_id = %run_id, "run failed: {}", message);
                }
                outcome => {
                    tracing::debug!(run_id = %run_id, ?outcome, "driver finished");
                }
            }
        });
    }
}
