use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::{StageContext, timestamp};
use crate::errors::OrchestrationError;
use crate::orchestration::llm::{LlmRequest, extract_json_object};
use crate::orchestration::models::{
    Checkpoint, Document, DocumentId, InvocationStatus, OrchestrationRun, RunStage,
    SynthesisReport, ToolInvocation, ToolKind,
};
use crate::orchestration::provenance::{ActivityDescriptor, AgentDescriptor, EntityDescriptor};

/// Cap on list items per artifact in the digest sent to the model.
const DIGEST_LIST_LIMIT: usize = 12;

const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You write cross-document syntheses for semantic-change studies.
You receive the experiment goal and a digest of tool outputs for each document, ordered by publication year,
plus embedding similarities between consecutive documents.

Respond with a single JSON object and nothing else:
{
  "narrative": "<several paragraphs tracing how the target term's meaning develops>",
  "key_findings": ["<finding>", ...],
  "semantic_shifts": [{"period": "<e.g. 1850-1900>", "description": "<what changed>"}, ...]
}"#;

/// Produce the cross-document report from the Execute artifacts.
pub async fn run(
    ctx: &StageContext,
    run: &OrchestrationRun,
    checkpoint: &Checkpoint,
) -> Result<SynthesisReport, OrchestrationError> {
    let started_at = timestamp();
    let client = ctx.llm.synthesis.clone();
    let agent = AgentDescriptor::language_model(client.model());
    let activity = ActivityDescriptor::new(
        &run.run_id,
        run.experiment_id,
        "synthesize",
        RunStage::Synthesizing,
        started_at,
    );

    let bundle = ctx.documents.load_experiment(run.experiment_id).await?;
    let run_id = run.run_id.clone();
    let invocations: Vec<ToolInvocation> = ctx
        .db(move |db| db.list_invocations(&run_id))
        .await?
        .into_iter()
        .filter(|inv| inv.status == InvocationStatus::Succeeded)
        .collect();

    let goal = checkpoint
        .analysis
        .as_ref()
        .map(|a| a.experiment_goal.clone())
        .unwrap_or_else(|| bundle.experiment.goal.clone());
    let prompt = build_prompt(
        &goal,
        bundle.experiment.target_term.as_deref(),
        &bundle.documents,
        &invocations,
    );

    let outcome = match client
        .complete(LlmRequest::new(SYNTHESIS_SYSTEM_PROMPT, prompt))
        .await
    {
        Ok(text) => parse_report(&text),
        Err(e) => Err(e.into()),
    };
    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            ctx.provenance
                .record(activity.failed(e.to_string()), vec![], agent)
                .await;
            return Err(e);
        }
    };

    let value = serde_json::to_value(&report).map_err(anyhow::Error::from)?;
    ctx.provenance
        .record(
            activity.with_metadata(json!({
                "model": client.model(),
                "artifacts": invocations.len(),
            })),
            vec![
                EntityDescriptor::new(
                    "synthesis_report",
                    format!("synthesis for run {}", run.run_id),
                    value,
                )
                .derived_from(invocations.iter().map(|inv| inv.entity_id.clone())),
            ],
            agent,
        )
        .await;

    let run_id = run.run_id.clone();
    let stored = report.clone();
    ctx.db(move |db| db.save_synthesis(&run_id, &stored)).await?;

    tracing::info!(
        run_id = %run.run_id,
        stage = "synthesizing",
        findings = report.key_findings.len(),
        shifts = report.semantic_shifts.len(),
        "synthesis complete"
    );
    Ok(report)
}

/// Parse the model's report. An empty narrative is a schema failure.
pub fn parse_report(text: &str) -> Result<SynthesisReport, OrchestrationError> {
    let stage = RunStage::Synthesizing;
    let json = extract_json_object(text)
        .ok_or_else(|| OrchestrationError::schema(stage, "response contains no JSON object"))?;
    let report: SynthesisReport = serde_json::from_str(json).map_err(|e| {
        OrchestrationError::schema(stage, format!("response does not match schema: {}", e))
    })?;
    if report.narrative.trim().is_empty() {
        return Err(OrchestrationError::schema(stage, "narrative is empty"));
    }
    Ok(report)
}

fn build_prompt(
    goal: &str,
    target_term: Option<&str>,
    documents: &[Document],
    invocations: &[ToolInvocation],
) -> String {
    let mut by_doc: BTreeMap<DocumentId, Vec<&ToolInvocation>> = BTreeMap::new();
    for inv in invocations {
        by_doc.entry(inv.document_id).or_default().push(inv);
    }

    let mut ordered: Vec<&Document> = documents
        .iter()
        .filter(|d| by_doc.contains_key(&d.id))
        .collect();
    ordered.sort_by_key(|d| (d.publication_year.unwrap_or(i32::MAX), d.id));

    let digests: Vec<Value> = ordered
        .iter()
        .map(|doc| {
            let tools: serde_json::Map<String, Value> = by_doc[&doc.id]
                .iter()
                .filter_map(|inv| {
                    let artifact = inv.artifact.as_ref()?;
                    Some((inv.tool.as_str().to_string(), digest_artifact(inv.tool, artifact)))
                })
                .collect();
            json!({
                "document_id": doc.id,
                "title": doc.title,
                "publication_year": doc.publication_year,
                "tools": tools,
            })
        })
        .collect();

    let similarities = consecutive_similarities(&ordered, &by_doc);

    format!(
        "Experiment goal: {}\nTarget term: {}\n\nDocument digests:\n{}\n\nEmbedding similarity between consecutive documents:\n{}",
        goal,
        target_term.unwrap_or("(none)"),
        serde_json::to_string_pretty(&digests).unwrap_or_default(),
        serde_json::to_string_pretty(&similarities).unwrap_or_default(),
    )
}

/// Trim an artifact to what the model needs; vectors are summarised separately.
fn digest_artifact(tool: ToolKind, artifact: &Value) -> Value {
    let truncated = |key: &str| -> Value {
        artifact
            .get(key)
            .and_then(Value::as_array)
            .map(|items| Value::Array(items.iter().take(DIGEST_LIST_LIMIT).cloned().collect()))
            .unwrap_or(Value::Null)
    };
    match tool {
        ToolKind::Segmentation => json!({ "count": artifact.get("count") }),
        ToolKind::EntityExtraction => json!({
            "count": artifact.get("count"),
            "entities": truncated("entities"),
        }),
        ToolKind::TemporalExtraction => json!({
            "earliest_year": artifact.get("earliest_year"),
            "latest_year": artifact.get("latest_year"),
            "expressions": truncated("expressions"),
        }),
        ToolKind::DefinitionExtraction => json!({
            "count": artifact.get("count"),
            "definitions": truncated("definitions"),
        }),
        ToolKind::EmbeddingGeneration => json!({
            "dimensions": artifact.get("dimensions"),
            "token_count": artifact.get("token_count"),
        }),
    }
}

fn consecutive_similarities(
    ordered: &[&Document],
    by_doc: &BTreeMap<DocumentId, Vec<&ToolInvocation>>,
) -> Vec<Value> {
    let vectors: Vec<(&Document, Vec<f64>)> = ordered
        .iter()
        .filter_map(|doc| {
            let vector = by_doc[&doc.id]
                .iter()
                .find(|inv| inv.tool == ToolKind::EmbeddingGeneration)?
                .artifact
                .as_ref()?
                .get("vector")?
                .as_array()?
                .iter()
                .filter_map(Value::as_f64)
                .collect();
            Some((*doc, vector))
        })
        .collect();

    vectors
        .windows(2)
        .filter_map(|pair| {
            let (a, va) = &pair[0];
            let (b, vb) = &pair[1];
            let similarity = cosine(va, vb)?;
            Some(json!({
                "from": { "document_id": a.id, "publication_year": a.publication_year },
                "to": { "document_id": b.id, "publication_year": b.publication_year },
                "cosine_similarity": (similarity * 1000.0).round() / 1000.0,
            }))
        })
        .collect()
}

fn cosine(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(dot / (na * nb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: i64, year: Option<i32>) -> Document {
        Document {
            id,
            experiment_id: 1,
            title: format!("doc {}", id),
            content: String::new(),
            publication_year: year,
            created_at: String::new(),
        }
    }

    fn inv(document_id: i64, tool: ToolKind, artifact: Value) -> ToolInvocation {
        ToolInvocation {
            run_id: "r".into(),
            document_id,
            tool,
            status: InvocationStatus::Succeeded,
            artifact: Some(artifact),
            error: None,
            activity_id: None,
            entity_id: None,
            completed_at: String::new(),
        }
    }

    #[test]
    fn test_parse_report() {
        let text = r#"```json
{"narrative": "Agent drifted from law to computing.",
 "key_findings": ["legal sense dominates before 1900"],
 "semantic_shifts": [{"period": "1900-1990", "description": "software sense appears"}]}
```"#;
        let report = parse_report(text).unwrap();
        assert_eq!(report.key_findings.len(), 1);
        assert_eq!(report.semantic_shifts[0].period, "1900-1990");
    }

    #[test]
    fn test_parse_report_rejects_empty_narrative() {
        let err = parse_report(r#"{"narrative": "  "}"#).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::SchemaValidation { stage: RunStage::Synthesizing, .. }
        ));
        assert!(parse_report("no json here").is_err());
    }

    #[test]
    fn test_cosine() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), None);
    }

    #[test]
    fn test_prompt_orders_by_year_and_drops_vectors() {
        let docs = vec![doc(1, Some(1990)), doc(2, Some(1850)), doc(3, None)];
        let invocations = vec![
            inv(1, ToolKind::EmbeddingGeneration, json!({"dimensions": 2, "token_count": 5, "vector": [1.0, 0.0]})),
            inv(2, ToolKind::EmbeddingGeneration, json!({"dimensions": 2, "token_count": 5, "vector": [0.6, 0.8]})),
            inv(2, ToolKind::Segmentation, json!({"count": 3, "segments": []})),
        ];
        let prompt = build_prompt("goal", Some("agent"), &docs, &invocations);

        let first = prompt.find("\"title\": \"doc 2\"").unwrap();
        let second = prompt.find("\"title\": \"doc 1\"").unwrap();
        assert!(first < second);
        assert!(!prompt.contains("doc 3"));
        assert!(!prompt.contains("\"vector\""));
        assert!(prompt.contains("\"cosine_similarity\": 0.6"));
    }
}
