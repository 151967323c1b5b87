use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use super::{StageContext, timestamp};
use crate::errors::OrchestrationError;
use crate::orchestration::llm::{LlmRequest, extract_json_object};
use crate::orchestration::models::{
    AnalysisSummary, DocumentPlan, OrchestrationRun, RunStage, StrategyRecommendation, ToolKind,
};
use crate::orchestration::provenance::{ActivityDescriptor, AgentDescriptor, EntityDescriptor};

const RECOMMEND_SYSTEM_PROMPT: &str = r#"You plan text-processing for a semantic-change study of historical documents.
Choose, for every document, an ordered list of tools from this registry (use the exact names):

{tools}

Respond with a single JSON object and nothing else:
{
  "documents_to_tools": { "<document id>": ["tool", ...], ... },
  "confidence": <number between 0 and 1>,
  "reasoning": "<why these tools suit these documents>"
}

Rules:
- Include every document id you are given, even if its list is empty.
- Never repeat a tool for the same document.
- Put "segmentation" first when later tools should work sentence by sentence."#;

/// Shape the model must produce. Unknown extra fields are tolerated.
#[derive(Debug, Deserialize)]
struct RawRecommendation {
    documents_to_tools: BTreeMap<String, Vec<String>>,
    confidence: f64,
    reasoning: String,
}

fn system_prompt() -> String {
    let tools: Vec<String> = ToolKind::ALL
        .iter()
        .map(|t| format!("- {}: {}", t.as_str(), t.description()))
        .collect();
    RECOMMEND_SYSTEM_PROMPT.replace("{tools}", &tools.join("\n"))
}

fn user_prompt(analysis: &AnalysisSummary) -> String {
    let profiles = serde_json::to_string_pretty(&analysis.documents).unwrap_or_default();
    format!(
        "Experiment goal: {}\nTarget term: {}\n\nDocument profiles:\n{}",
        analysis.experiment_goal,
        analysis.target_term.as_deref().unwrap_or("(none)"),
        profiles
    )
}

/// Ask the extraction model for a processing strategy and persist it.
pub async fn run(
    ctx: &StageContext,
    run: &OrchestrationRun,
    analysis: &AnalysisSummary,
    analysis_entity: Option<String>,
) -> Result<StrategyRecommendation, OrchestrationError> {
    let started_at = timestamp();
    let client = ctx.llm.extraction.clone();
    let agent = AgentDescriptor::language_model(client.model());
    let activity = ActivityDescriptor::new(
        &run.run_id,
        run.experiment_id,
        "recommend",
        RunStage::Recommending,
        started_at,
    );

    let outcome = match client
        .complete(LlmRequest::new(system_prompt(), user_prompt(analysis)))
        .await
    {
        Ok(text) => parse_recommendation(&text, analysis),
        Err(e) => Err(e.into()),
    };

    let recommendation = match outcome {
        Ok(rec) => rec,
        Err(e) => {
            ctx.provenance
                .record(activity.failed(e.to_string()), vec![], agent)
                .await;
            return Err(e);
        }
    };

    let value = serde_json::to_value(&recommendation).map_err(anyhow::Error::from)?;
    let recorded = ctx
        .provenance
        .record(
            activity.with_metadata(serde_json::json!({ "model": client.model() })),
            vec![
                EntityDescriptor::new(
                    "strategy_recommendation",
                    format!("recommended strategy for run {}", run.run_id),
                    value,
                )
                .derived_from([analysis_entity]),
            ],
            agent,
        )
        .await;
    let entity = recorded.and_then(|r| r.entity_ids.into_iter().next());

    let run_id = run.run_id.clone();
    let stored = recommendation.clone();
    ctx.db(move |db| db.save_recommendation(&run_id, &stored, entity.as_deref()))
        .await?;

    tracing::info!(
        run_id = %run.run_id,
        stage = "recommending",
        confidence = recommendation.confidence,
        planned = recommendation.documents_to_tools.values().map(Vec::len).sum::<usize>(),
        "strategy recommended"
    );
    Ok(recommendation)
}

/// Parse and validate a model response against the recommendation schema.
pub fn parse_recommendation(
    text: &str,
    analysis: &AnalysisSummary,
) -> Result<StrategyRecommendation, OrchestrationError> {
    let stage = RunStage::Recommending;
    let json = extract_json_object(text)
        .ok_or_else(|| OrchestrationError::schema(stage, "response contains no JSON object"))?;
    let raw: RawRecommendation = serde_json::from_str(json)
        .map_err(|e| OrchestrationError::schema(stage, format!("response does not match schema: {}", e)))?;

    if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
        return Err(OrchestrationError::schema(
            stage,
            format!("confidence {} is outside [0, 1]", raw.confidence),
        ));
    }

    let mut plan = DocumentPlan::new();
    for (key, tools) in raw.documents_to_tools {
        let doc_id: i64 = key.trim().parse().map_err(|_| {
            OrchestrationError::schema(stage, format!("document key '{}' is not a document id", key))
        })?;
        let tools = parse_tool_list(&tools).map_err(|m| {
            OrchestrationError::schema(stage, format!("document {}: {}", doc_id, m))
        })?;
        if plan.insert(doc_id, tools).is_some() {
            return Err(OrchestrationError::schema(
                stage,
                format!("document {} is listed more than once", doc_id),
            ));
        }
    }

    let known: HashSet<i64> = analysis.document_ids().into_iter().collect();
    if let Some(unknown) = plan.keys().find(|id| !known.contains(*id)) {
        return Err(OrchestrationError::schema(
            stage,
            format!("document {} is not part of the experiment", unknown),
        ));
    }
    let mut missing: Vec<i64> = known.iter().filter(|id| !plan.contains_key(*id)).copied().collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(OrchestrationError::schema(
            stage,
            format!("documents missing from strategy: {:?}", missing),
        ));
    }
    if plan.values().all(Vec::is_empty) {
        return Err(OrchestrationError::schema(stage, "strategy assigns no tools"));
    }

    Ok(StrategyRecommendation {
        documents_to_tools: plan,
        confidence: raw.confidence,
        reasoning: raw.reasoning,
    })
}

/// Resolve tool names against the registry, rejecting unknowns and repeats.
pub fn parse_tool_list(names: &[String]) -> Result<Vec<ToolKind>, String> {
    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(names.len());
    for name in names {
        let tool: ToolKind = name.trim().parse()?;
        if !seen.insert(tool) {
            return Err(format!("tool '{}' listed twice", tool));
        }
        tools.push(tool);
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::models::DocumentProfile;

    fn analysis(ids: &[i64]) -> AnalysisSummary {
        AnalysisSummary {
            experiment_id: 1,
            experiment_goal: "goal".into(),
            target_term: Some("agent".into()),
            documents: ids
                .iter()
                .map(|&id| DocumentProfile {
                    document_id: id,
                    title: format!("doc {}", id),
                    publication_year: None,
                    word_count: 10,
                    char_count: 50,
                    ocr_quality: 1.0,
                    ocr_suspect: false,
                    domain_hints: vec![],
                    mentions_target: true,
                })
                .collect(),
        }
    }

    fn schema_message(err: OrchestrationError) -> String {
        match err {
            OrchestrationError::SchemaValidation { stage, message } => {
                assert_eq!(stage, RunStage::Recommending);
                message
            }
            other => panic!("Expected SchemaValidation, got {:?}", other),
        }
    }

    #[test]
    fn test_parses_fenced_response() {
        let text = r#"Sure!
```json
{"documents_to_tools": {"1": ["segmentation", "entity_extraction"], "2": []},
 "confidence": 0.82, "reasoning": "short clean texts", "extra": true}
```"#;
        let rec = parse_recommendation(text, &analysis(&[1, 2])).unwrap();
        assert_eq!(
            rec.documents_to_tools[&1],
            vec![ToolKind::Segmentation, ToolKind::EntityExtraction]
        );
        assert!(rec.documents_to_tools[&2].is_empty());
        assert_eq!(rec.confidence, 0.82);
    }

    #[test]
    fn test_unparsable_response_fails() {
        let msg = schema_message(parse_recommendation("I cannot help", &analysis(&[1])).unwrap_err());
        assert!(msg.contains("no JSON"));
        let msg = schema_message(
            parse_recommendation(r#"{"confidence": 0.5}"#, &analysis(&[1])).unwrap_err(),
        );
        assert!(msg.contains("documents_to_tools"));
    }

    #[test]
    fn test_unknown_tool_fails() {
        let text = r#"{"documents_to_tools": {"1": ["ocr_cleanup"]}, "confidence": 0.5, "reasoning": ""}"#;
        let msg = schema_message(parse_recommendation(text, &analysis(&[1])).unwrap_err());
        assert!(msg.contains("ocr_cleanup"));
    }

    #[test]
    fn test_duplicate_tool_fails() {
        let text = r#"{"documents_to_tools": {"1": ["segmentation", "segmentation"]}, "confidence": 0.5, "reasoning": ""}"#;
        let msg = schema_message(parse_recommendation(text, &analysis(&[1])).unwrap_err());
        assert!(msg.contains("twice"));
    }

    #[test]
    fn test_confidence_out_of_range_fails() {
        let text = r#"{"documents_to_tools": {"1": ["segmentation"]}, "confidence": 1.5, "reasoning": ""}"#;
        let msg = schema_message(parse_recommendation(text, &analysis(&[1])).unwrap_err());
        assert!(msg.contains("confidence"));
    }

    #[test]
    fn test_aliased_document_keys_rejected() {
        let text = r#"{"documents_to_tools": {"1": ["segmentation"], " 1": ["entity_extraction"]}, "confidence": 0.5, "reasoning": ""}"#;
        let msg = schema_message(parse_recommendation(text, &analysis(&[1])).unwrap_err());
        assert!(msg.contains("more than once"));
    }

    #[test]
    fn test_document_coverage_enforced() {
        let unknown = r#"{"documents_to_tools": {"1": ["segmentation"], "9": []}, "confidence": 0.5, "reasoning": ""}"#;
        let msg = schema_message(parse_recommendation(unknown, &analysis(&[1])).unwrap_err());
        assert!(msg.contains("document 9"));

        let missing = r#"{"documents_to_tools": {"1": ["segmentation"]}, "confidence": 0.5, "reasoning": ""}"#;
        let msg = schema_message(parse_recommendation(missing, &analysis(&[1, 2])).unwrap_err());
        assert!(msg.contains("missing"));
    }

    #[test]
    fn test_empty_strategy_rejected() {
        let text = r#"{"documents_to_tools": {"1": []}, "confidence": 0.5, "reasoning": ""}"#;
        let msg = schema_message(parse_recommendation(text, &analysis(&[1])).unwrap_err());
        assert!(msg.contains("no tools"));
    }

    #[test]
    fn test_system_prompt_lists_registry() {
        let prompt = system_prompt();
        for tool in ToolKind::ALL {
            assert!(prompt.contains(tool.as_str()));
        }
    }
}
