use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use futures::stream;

use super::{StageContext, interpolate, timestamp};
use crate::errors::OrchestrationError;
use crate::orchestration::models::{
    Checkpoint, Document, DocumentId, InvocationStatus, OrchestrationRun, RunStage, ToolInvocation,
    ToolKind,
};
use crate::orchestration::provenance::{ActivityDescriptor, AgentDescriptor, EntityDescriptor};
use crate::orchestration::tools::{Segment, ToolInput, segments_from_artifact};

/// Counts for one pass over the effective strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub planned: usize,
    /// Pairs already in the ledger from an earlier attempt.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Per-document work item. `None` means the document vanished from the store.
struct DocumentJob {
    document_id: DocumentId,
    document: Option<Document>,
    tools: Vec<ToolKind>,
}

/// Shared, read-only state for every document job of one pass.
struct Pass {
    ctx: StageContext,
    run_id: String,
    experiment_id: i64,
    target_term: Option<String>,
    strategy_entity: Option<String>,
    ledger: HashMap<(DocumentId, ToolKind), ToolInvocation>,
    done: AtomicUsize,
    total: usize,
}

/// Run every planned (document, tool) pair that is not yet in the ledger.
///
/// A failing invocation is recorded and the pass continues; the stage only
/// fails when nothing in the whole plan succeeded.
pub async fn run(
    ctx: &StageContext,
    run: &OrchestrationRun,
    checkpoint: &Checkpoint,
) -> Result<ExecutionSummary, OrchestrationError> {
    let plan = checkpoint.effective_strategy().cloned().ok_or_else(|| {
        OrchestrationError::Other(anyhow::anyhow!(
            "Run {} reached execution without an approved strategy",
            run.run_id
        ))
    })?;

    let bundle = ctx.documents.load_experiment(run.experiment_id).await?;
    let mut by_id: HashMap<DocumentId, Document> =
        bundle.documents.into_iter().map(|d| (d.id, d)).collect();

    let run_id = run.run_id.clone();
    let ledger: HashMap<(DocumentId, ToolKind), ToolInvocation> = ctx
        .db(move |db| db.list_invocations(&run_id))
        .await?
        .into_iter()
        .map(|inv| ((inv.document_id, inv.tool), inv))
        .collect();

    let total: usize = plan.values().map(Vec::len).sum();
    let skipped = plan
        .iter()
        .flat_map(|(doc, tools)| tools.iter().map(move |t| (*doc, *t)))
        .filter(|pair| ledger.contains_key(pair))
        .count();

    tracing::info!(
        run_id = %run.run_id,
        stage = "executing",
        planned = total,
        skipped,
        documents = plan.len(),
        "execution started"
    );

    let jobs: Vec<DocumentJob> = plan
        .iter()
        .filter(|(_, tools)| !tools.is_empty())
        .map(|(doc_id, tools)| DocumentJob {
            document_id: *doc_id,
            document: by_id.remove(doc_id),
            tools: tools.clone(),
        })
        .collect();

    let pass = Arc::new(Pass {
        ctx: ctx.clone(),
        run_id: run.run_id.clone(),
        experiment_id: run.experiment_id,
        target_term: bundle.experiment.target_term,
        strategy_entity: checkpoint.strategy_entity.clone(),
        ledger,
        done: AtomicUsize::new(skipped),
        total,
    });

    let width = ctx.settings.max_concurrent_documents.max(1);
    let results: Vec<Result<(), OrchestrationError>> = stream::iter(jobs)
        .map(|job| {
            let pass = Arc::clone(&pass);
            async move { pass.run_document(job).await }
        })
        .buffer_unordered(width)
        .collect()
        .await;
    for result in results {
        result?;
    }

    let run_id = run.run_id.clone();
    let recorded = ctx.db(move |db| db.list_invocations(&run_id)).await?;
    let planned: HashSet<(DocumentId, ToolKind)> = plan
        .iter()
        .flat_map(|(doc, tools)| tools.iter().map(move |t| (*doc, *t)))
        .collect();
    let mut summary = ExecutionSummary {
        planned: total,
        skipped,
        ..Default::default()
    };
    for inv in recorded
        .iter()
        .filter(|inv| planned.contains(&(inv.document_id, inv.tool)))
    {
        match inv.status {
            InvocationStatus::Succeeded => summary.succeeded += 1,
            InvocationStatus::Failed => summary.failed += 1,
        }
    }

    if summary.succeeded == 0 {
        return Err(OrchestrationError::ExecutionStalled { attempted: total });
    }

    tracing::info!(
        run_id = %run.run_id,
        stage = "executing",
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        "execution complete"
    );
    Ok(summary)
}

impl Pass {
    /// Tools for one document, strictly in plan order.
    async fn run_document(&self, job: DocumentJob) -> Result<(), OrchestrationError> {
        let mut segments: Option<Vec<Segment>> = None;
        let mut segmentation_entity: Option<String> = None;

        for tool in job.tools {
            if let Some(previous) = self.ledger.get(&(job.document_id, tool)) {
                if tool == ToolKind::Segmentation && previous.status == InvocationStatus::Succeeded {
                    segments = previous.artifact.as_ref().and_then(segments_from_artifact);
                    segmentation_entity = previous.entity_id.clone();
                }
                tracing::debug!(
                    run_id = %self.run_id,
                    document_id = job.document_id,
                    tool = %tool,
                    "invocation already recorded, skipping"
                );
                continue;
            }

            let started_at = timestamp();
            let outcome = match &job.document {
                Some(document) => {
                    let input = ToolInput {
                        document: document.clone(),
                        target_term: self.target_term.clone(),
                        segments: segments.clone(),
                    };
                    self.ctx
                        .tools
                        .run(tool, &input)
                        .await
                        .map_err(|e| format!("{:#}", e))
                }
                None => Err("document is no longer in the experiment".to_string()),
            };

            let activity = ActivityDescriptor::new(
                &self.run_id,
                self.experiment_id,
                format!("tool:{}", tool),
                RunStage::Executing,
                started_at,
            )
            .with_metadata(serde_json::json!({
                "document_id": job.document_id,
                "tool": tool.as_str(),
            }));
            let agent = AgentDescriptor::software(format!("ontextract-tool:{}", tool));

            let invocation = match outcome {
                Ok(artifact) => {
                    let upstream = if tool == ToolKind::Segmentation {
                        vec![self.strategy_entity.clone()]
                    } else {
                        vec![self.strategy_entity.clone(), segmentation_entity.clone()]
                    };
                    let recorded = self
                        .ctx
                        .provenance
                        .record(
                            activity,
                            vec![
                                EntityDescriptor::new(
                                    "tool_artifact",
                                    format!("{} output for document {}", tool, job.document_id),
                                    artifact.clone(),
                                )
                                .derived_from(upstream),
                            ],
                            agent,
                        )
                        .await;
                    let entity_id = recorded.as_ref().and_then(|r| r.entity_ids.first().cloned());
                    if tool == ToolKind::Segmentation {
                        segments = segments_from_artifact(&artifact);
                        segmentation_entity = entity_id.clone();
                    }
                    ToolInvocation {
                        run_id: self.run_id.clone(),
                        document_id: job.document_id,
                        tool,
                        status: InvocationStatus::Succeeded,
                        artifact: Some(artifact),
                        error: None,
                        activity_id: recorded.map(|r| r.activity_id),
                        entity_id,
                        completed_at: timestamp(),
                    }
                }
                Err(message) => {
                    let err = OrchestrationError::ToolInvocation {
                        document_id: job.document_id,
                        tool,
                        message,
                    };
                    tracing::warn!(
                        run_id = %self.run_id,
                        document_id = job.document_id,
                        tool = %tool,
                        "{}",
                        err
                    );
                    let recorded = self
                        .ctx
                        .provenance
                        .record(activity.failed(err.to_string()), vec![], agent)
                        .await;
                    ToolInvocation {
                        run_id: self.run_id.clone(),
                        document_id: job.document_id,
                        tool,
                        status: InvocationStatus::Failed,
                        artifact: None,
                        error: Some(err.to_string()),
                        activity_id: recorded.map(|r| r.activity_id),
                        entity_id: None,
                        completed_at: timestamp(),
                    }
                }
            };

            self.ctx
                .db(move |db| db.record_invocation(&invocation))
                .await?;

            let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
            self.ctx
                .report_progress(
                    &self.run_id,
                    interpolate(
                        RunStage::Executing.entry_progress(),
                        RunStage::Synthesizing.entry_progress(),
                        done,
                        self.total,
                    ),
                )
                .await;
        }
        Ok(())
    }
}
