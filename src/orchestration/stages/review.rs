use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::recommend::parse_tool_list;
use super::{StageContext, timestamp};
use crate::errors::OrchestrationError;
use crate::orchestration::models::{
    AnalysisSummary, DocumentPlan, OrchestrationRun, ReviewDecision, ReviewRecord, RunStage,
    RunStatus,
};
use crate::orchestration::provenance::{ActivityDescriptor, AgentDescriptor, EntityDescriptor};

/// Agent for decisions taken by the review policy instead of a person.
pub const AUTO_REVIEW_AGENT: &str = "ontextract-auto-review";
/// Agent for decisions submitted through the API.
pub const HUMAN_REVIEWER_AGENT: &str = "human-reviewer";

/// A review as submitted, before the strategy is parsed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewRequest {
    #[serde(rename = "strategy_approved")]
    pub approved: bool,
    #[serde(default)]
    pub modified_strategy: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub review_notes: Option<String>,
}

impl ReviewRequest {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Default::default()
        }
    }

    pub fn reject(notes: impl Into<String>) -> Self {
        Self {
            approved: false,
            modified_strategy: None,
            review_notes: Some(notes.into()),
        }
    }

    pub fn with_strategy(mut self, plan: &DocumentPlan) -> Self {
        self.modified_strategy = Some(
            plan.iter()
                .map(|(doc, tools)| {
                    (doc.to_string(), tools.iter().map(|t| t.as_str().to_string()).collect())
                })
                .collect(),
        );
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.review_notes = Some(notes.into());
        self
    }
}

/// Turn a submitted `{doc_id: [tool, ...]}` map into a typed plan.
pub fn parse_modified_strategy(
    raw: BTreeMap<String, Vec<String>>,
) -> Result<DocumentPlan, OrchestrationError> {
    let mut plan = DocumentPlan::new();
    for (key, tools) in raw {
        let doc_id: i64 = key.trim().parse().map_err(|_| {
            OrchestrationError::InvalidStrategy(format!("'{}' is not a document id", key))
        })?;
        let tools = parse_tool_list(&tools)
            .map_err(|m| OrchestrationError::InvalidStrategy(format!("document {}: {}", doc_id, m)))?;
        if plan.insert(doc_id, tools).is_some() {
            return Err(OrchestrationError::InvalidStrategy(format!(
                "document {} is listed more than once",
                doc_id
            )));
        }
    }
    Ok(plan)
}

/// A replacement plan may only name analysed documents and must run something.
pub fn validate_modified_strategy(
    plan: &DocumentPlan,
    analysis: Option<&AnalysisSummary>,
) -> Result<(), OrchestrationError> {
    if let Some(analysis) = analysis {
        let known: HashSet<i64> = analysis.document_ids().into_iter().collect();
        if let Some(unknown) = plan.keys().find(|id| !known.contains(*id)) {
            return Err(OrchestrationError::InvalidStrategy(format!(
                "document {} is not part of the experiment",
                unknown
            )));
        }
    }
    for (doc_id, tools) in plan {
        let unique: HashSet<_> = tools.iter().collect();
        if unique.len() != tools.len() {
            return Err(OrchestrationError::InvalidStrategy(format!(
                "document {} lists a tool twice",
                doc_id
            )));
        }
    }
    if plan.values().all(Vec::is_empty) {
        return Err(OrchestrationError::InvalidStrategy(
            "modified strategy assigns no tools".to_string(),
        ));
    }
    Ok(())
}

/// Record the single review decision for a run.
///
/// Rejected with `ReviewConflict` unless the run is in `reviewing` with no
/// recorded decision, whatever the payload. A rejection is recorded and
/// leaves the run parked.
pub async fn submit(
    ctx: &StageContext,
    run_id: &str,
    request: ReviewRequest,
    auto_approved: bool,
) -> Result<OrchestrationRun, OrchestrationError> {
    let id = run_id.to_string();
    let (run, checkpoint) = ctx
        .db(move |db| Ok((db.require_run(&id)?, db.load_checkpoint(&id)?)))
        .await?;

    let decided = checkpoint.review.is_some();
    if run.current_stage != RunStage::Reviewing || run.status != RunStatus::Reviewing || decided {
        return Err(OrchestrationError::ReviewConflict {
            run_id: run_id.to_string(),
            stage: run.current_stage,
            decided,
        });
    }
    let modified_strategy = request
        .modified_strategy
        .map(parse_modified_strategy)
        .transpose()?;
    if let Some(plan) = &modified_strategy {
        validate_modified_strategy(plan, checkpoint.analysis.as_ref())?;
    }
    let decision = ReviewDecision {
        approved: request.approved,
        modified_strategy,
        review_notes: request.review_notes,
    };

    let started_at = timestamp();
    let record = ReviewRecord {
        decision,
        decided_at: started_at.clone(),
        auto_approved,
    };
    let id = run_id.to_string();
    let stored = record.clone();
    let run = ctx.db(move |db| db.apply_review(&id, &stored)).await?;

    let agent = if auto_approved {
        AgentDescriptor::software(AUTO_REVIEW_AGENT)
    } else {
        AgentDescriptor::person(HUMAN_REVIEWER_AGENT)
    };
    let approved = record.decision.approved;
    let modified = record.decision.modified_strategy.is_some();
    let entity = if approved {
        let effective = record
            .decision
            .modified_strategy
            .as_ref()
            .or(checkpoint.recommendation.as_ref().map(|r| &r.documents_to_tools));
        EntityDescriptor::new(
            "approved_strategy",
            format!("approved strategy for run {}", run_id),
            serde_json::to_value(effective).map_err(anyhow::Error::from)?,
        )
    } else {
        EntityDescriptor::new(
            "review_decision",
            format!("rejected strategy for run {}", run_id),
            serde_json::to_value(&record).map_err(anyhow::Error::from)?,
        )
    };
    let recorded = ctx
        .provenance
        .record(
            ActivityDescriptor::new(
                run_id,
                run.experiment_id,
                "review",
                RunStage::Reviewing,
                started_at,
            )
            .with_metadata(serde_json::json!({
                "approved": approved,
                "modified": modified,
                "auto_approved": auto_approved,
                "review_notes": record.decision.review_notes,
            })),
            vec![entity.derived_from([checkpoint.recommendation_entity.clone()])],
            agent,
        )
        .await;

    if approved && let Some(entity_id) = recorded.and_then(|r| r.entity_ids.into_iter().next()) {
        let id = run_id.to_string();
        if let Err(e) = ctx.db(move |db| db.set_strategy_entity(&id, &entity_id)).await {
            tracing::warn!(run_id = %run_id, "failed to link approved strategy entity: {}", e);
        }
    }

    tracing::info!(
        run_id = %run_id,
        stage = "reviewing",
        approved,
        modified,
        auto_approved,
        "review decision recorded"
    );
    Ok(run)
}
