//! The run state machine.
//!
//! `drive` rebuilds everything from the durable run row and checkpoint on
//! each step, so the same loop serves fresh runs, review continuations and
//! crash recovery. A stage whose output is already checkpointed is not
//! re-run; only the transition is retried.

use super::models::{Checkpoint, OrchestrationRun, RunStage, RunStatus};
use super::stages::review::{self, ReviewRequest};
use super::stages::{StageContext, analyze, execute, recommend, synthesize};
use crate::config::ReviewPolicy;
use crate::errors::OrchestrationError;

/// How a `drive` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    /// Parked in `reviewing` until a decision arrives.
    AwaitingReview,
    /// Parked in `reviewing` after a rejection.
    Rejected,
    Failed(String),
    /// Another writer moved the run; this driver stepped aside.
    Superseded,
}

enum Step {
    Continue,
    Suspend(DriveOutcome),
}

/// Advance a run as far as it can go without outside input.
pub async fn drive(ctx: &StageContext, run_id: &str) -> DriveOutcome {
    loop {
        let id = run_id.to_string();
        let run = match ctx.db(move |db| db.require_run(&id)).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(run_id = %run_id, "failed to load run: {}", e);
                return DriveOutcome::Failed(e.to_string());
            }
        };

        match run.status {
            RunStatus::Completed => return DriveOutcome::Completed,
            RunStatus::Failed => {
                return DriveOutcome::Failed(run.error_message.unwrap_or_default());
            }
            RunStatus::Running | RunStatus::Reviewing => {}
        }

        // An unreadable checkpoint can never make progress, so the run fails
        // where pollers can see it.
        let id = run_id.to_string();
        let checkpoint = match ctx.db(move |db| db.load_checkpoint(&id)).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                let message = format!("Failed to load checkpoint: {}", e);
                record_failure(ctx, run_id, run.current_stage, &message).await;
                return DriveOutcome::Failed(message);
            }
        };

        let stage = run.current_stage;
        match step(ctx, &run, &checkpoint).await {
            Ok(Step::Continue) => {}
            Ok(Step::Suspend(outcome)) => return outcome,
            Err(e) if !e.is_stage_fatal() => {
                tracing::info!(run_id = %run_id, stage = %stage, "driver stepping aside: {}", e);
                return DriveOutcome::Superseded;
            }
            Err(e) => {
                let message = e.to_string();
                record_failure(ctx, run_id, stage, &message).await;
                return DriveOutcome::Failed(message);
            }
        }
    }
}

async fn record_failure(ctx: &StageContext, run_id: &str, stage: RunStage, message: &str) {
    tracing::error!(run_id = %run_id, stage = %stage, "stage failed: {}", message);
    let id = run_id.to_string();
    let stored = message.to_string();
    if let Err(db_err) = ctx.db(move |db| db.fail_run(&id, &stored)).await {
        tracing::error!(run_id = %run_id, "failed to record run failure: {}", db_err);
    }
}

async fn step(
    ctx: &StageContext,
    run: &OrchestrationRun,
    checkpoint: &Checkpoint,
) -> Result<Step, OrchestrationError> {
    match run.current_stage {
        RunStage::Analyzing => {
            if checkpoint.analysis.is_none() {
                analyze::run(ctx, run).await?;
            }
            advance(ctx, run, RunStage::Recommending).await
        }
        RunStage::Recommending => {
            if checkpoint.recommendation.is_none() {
                let analysis = checkpoint.analysis.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("Run {} has no analysis to recommend from", run.run_id)
                })?;
                recommend::run(ctx, run, analysis, checkpoint.analysis_entity.clone()).await?;
            }
            advance(ctx, run, RunStage::Reviewing).await
        }
        RunStage::Reviewing => {
            if let Some(record) = &checkpoint.review {
                // An approval moves the stage in the same transaction, so a
                // recorded decision seen here is a rejection.
                if !record.decision.approved {
                    tracing::info!(run_id = %run.run_id, stage = "reviewing", "strategy rejected, run parked");
                    return Ok(Step::Suspend(DriveOutcome::Rejected));
                }
                return Err(anyhow::anyhow!(
                    "Run {} has an approved review but never left reviewing",
                    run.run_id
                )
                .into());
            }
            if run.review_choices || ctx.settings.review_policy == ReviewPolicy::RequireReview {
                tracing::info!(run_id = %run.run_id, stage = "reviewing", "awaiting review");
                return Ok(Step::Suspend(DriveOutcome::AwaitingReview));
            }
            let request = ReviewRequest::approve().with_notes("approved by review policy");
            match review::submit(ctx, &run.run_id, request, true).await {
                Ok(_) | Err(OrchestrationError::ReviewConflict { .. }) => Ok(Step::Continue),
                Err(e) => Err(e),
            }
        }
        RunStage::Executing => {
            execute::run(ctx, run, checkpoint).await?;
            advance(ctx, run, RunStage::Synthesizing).await
        }
        RunStage::Synthesizing => {
            if checkpoint.synthesis.is_none() {
                synthesize::run(ctx, run, checkpoint).await?;
            }
            advance(ctx, run, RunStage::Completed).await
        }
        RunStage::Completed => Ok(Step::Suspend(DriveOutcome::Completed)),
    }
}

async fn advance(
    ctx: &StageContext,
    run: &OrchestrationRun,
    to: RunStage,
) -> Result<Step, OrchestrationError> {
    let id = run.run_id.clone();
    let from = run.current_stage;
    let updated = ctx.db(move |db| db.advance_stage(&id, from, to)).await?;
    tracing::info!(
        run_id = %run.run_id,
        from = %from,
        to = %to,
        progress = updated.progress_percentage,
        "stage transition"
    );
    Ok(Step::Continue)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::orchestration::db::{DbHandle, OrchestrationDb};
    use crate::orchestration::documents::SqliteDocumentStore;
    use crate::orchestration::llm::{LlmClients, ScriptedLlmClient};
    use crate::orchestration::stages::StageSettings;
    use crate::orchestration::tools::BuiltinTools;

    const RECOMMENDATION: &str = r#"{"documents_to_tools": {"1": ["segmentation", "definition_extraction"]}, "confidence": 0.7, "reasoning": "one clean document"}"#;
    const SYNTHESIS: &str = r#"{"narrative": "The term narrowed.", "key_findings": ["narrowing"]}"#;

    fn context(extraction: ScriptedLlmClient, policy: ReviewPolicy) -> (StageContext, Arc<ScriptedLlmClient>) {
        let db = DbHandle::new(OrchestrationDb::new_in_memory().unwrap());
        {
            let conn = db.lock_sync().unwrap();
            let exp = conn.create_experiment("e", "Trace 'agent'", Some("agent")).unwrap();
            conn.add_document(exp.id, "A", "An agent is defined as one who acts for another.", Some(1900))
                .unwrap();
        }
        let extraction = Arc::new(extraction);
        let ctx = StageContext::new(
            db.clone(),
            Arc::new(SqliteDocumentStore::new(db)),
            LlmClients::new(
                extraction.clone(),
                Arc::new(ScriptedLlmClient::fixed("synth", SYNTHESIS)),
            ),
            Arc::new(BuiltinTools::default()),
            StageSettings {
                review_policy: policy,
                ..Default::default()
            },
        );
        (ctx, extraction)
    }

    async fn create_run(ctx: &StageContext, review_choices: bool) -> String {
        ctx.db(move |db| db.create_run("run-g", 1, review_choices))
            .await
            .unwrap()
            .run_id
    }

    #[tokio::test]
    async fn test_suspends_for_review() {
        let (ctx, _) = context(ScriptedLlmClient::fixed("m", RECOMMENDATION), ReviewPolicy::AutoApprove);
        let run_id = create_run(&ctx, true).await;

        assert_eq!(drive(&ctx, &run_id).await, DriveOutcome::AwaitingReview);
        let run = ctx.db(|db| db.require_run("run-g")).await.unwrap();
        assert_eq!(run.current_stage, RunStage::Reviewing);
        assert_eq!(run.status, RunStatus::Reviewing);
        assert_eq!(run.progress_percentage, 40);
    }

    #[tokio::test]
    async fn test_auto_approve_runs_to_completion() {
        let (ctx, _) = context(ScriptedLlmClient::fixed("m", RECOMMENDATION), ReviewPolicy::AutoApprove);
        let run_id = create_run(&ctx, false).await;

        assert_eq!(drive(&ctx, &run_id).await, DriveOutcome::Completed);
        let checkpoint = ctx.db(|db| db.load_checkpoint("run-g")).await.unwrap();
        let review = checkpoint.review.unwrap();
        assert!(review.auto_approved);
        assert!(review.decision.approved);
        assert_eq!(checkpoint.synthesis.unwrap().narrative, "The term narrowed.");
        let run = ctx.db(|db| db.require_run("run-g")).await.unwrap();
        assert_eq!(run.progress_percentage, 100);
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_fails_run() {
        let (ctx, extraction) =
            context(ScriptedLlmClient::fixed("m", RECOMMENDATION), ReviewPolicy::AutoApprove);
        let run_id = create_run(&ctx, true).await;
        ctx.db(|db| {
            db.connection().execute(
                "UPDATE run_checkpoints SET analysis = '{not json' WHERE run_id = 'run-g'",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let outcome = drive(&ctx, &run_id).await;
        assert!(matches!(outcome, DriveOutcome::Failed(ref m) if m.contains("checkpoint")));

        let run = ctx.db(|db| db.require_run("run-g")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_stage, RunStage::Analyzing);
        assert!(run.error_message.unwrap().contains("Failed to parse analysis"));
        assert!(run.ended_at.is_some());
        assert_eq!(extraction.calls(), 0);
    }

    #[tokio::test]
    async fn test_require_review_policy_suspends() {
        let (ctx, _) = context(ScriptedLlmClient::fixed("m", RECOMMENDATION), ReviewPolicy::RequireReview);
        let run_id = create_run(&ctx, false).await;
        assert_eq!(drive(&ctx, &run_id).await, DriveOutcome::AwaitingReview);
    }

    #[tokio::test]
    async fn test_schema_failure_fails_run_in_stage() {
        let (ctx, _) = context(ScriptedLlmClient::fixed("m", "not json"), ReviewPolicy::AutoApprove);
        let run_id = create_run(&ctx, true).await;

        assert!(matches!(drive(&ctx, &run_id).await, DriveOutcome::Failed(_)));
        let run = ctx.db(|db| db.require_run("run-g")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_stage, RunStage::Recommending);
        assert!(run.error_message.unwrap().contains("Schema validation failed"));
    }

    #[tokio::test]
    async fn test_redrive_does_not_repeat_recommend() {
        let (ctx, extraction) = context(ScriptedLlmClient::fixed("m", RECOMMENDATION), ReviewPolicy::AutoApprove);
        let run_id = create_run(&ctx, true).await;

        drive(&ctx, &run_id).await;
        assert_eq!(drive(&ctx, &run_id).await, DriveOutcome::AwaitingReview);
        assert_eq!(extraction.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejection_parks_run() {
        let (ctx, _) = context(ScriptedLlmClient::fixed("m", RECOMMENDATION), ReviewPolicy::AutoApprove);
        let run_id = create_run(&ctx, true).await;
        drive(&ctx, &run_id).await;

        review::submit(&ctx, &run_id, ReviewRequest::reject("wrong tools"), false)
            .await
            .unwrap();

        assert_eq!(drive(&ctx, &run_id).await, DriveOutcome::Rejected);
        let run = ctx.db(|db| db.require_run("run-g")).await.unwrap();
        assert_eq!(run.current_stage, RunStage::Reviewing);
    }
}
