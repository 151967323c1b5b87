use std::sync::LazyLock;

use regex::Regex;

use super::{StageContext, timestamp};
use crate::errors::OrchestrationError;
use crate::orchestration::models::{
    AnalysisSummary, Document, DocumentProfile, ExperimentBundle, OrchestrationRun, RunStage,
};
use crate::orchestration::provenance::{ActivityDescriptor, AgentDescriptor, EntityDescriptor};

pub const ANALYZER_AGENT: &str = "ontextract-analyzer";

/// Below this share of clean tokens a document is flagged as OCR-suspect.
const OCR_SUSPECT_THRESHOLD: f64 = 0.8;

static CLEAN_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[("'\[]*(?:\p{L}+(?:['’-]\p{L}+)*|\d+(?:[.,]\d+)*)[)"'\].,;:!?]*$"#)
        .expect("valid token regex")
});

/// Keyword lexicons used to hint at a document's domain.
const DOMAIN_LEXICON: &[(&str, &[&str])] = &[
    ("law", &["court", "statute", "plaintiff", "defendant", "contract", "liability", "jurisdiction"]),
    ("philosophy", &["reason", "metaphysics", "ontology", "epistemology", "ethics", "moral", "virtue"]),
    ("science", &["experiment", "hypothesis", "theory", "observation", "molecule", "species"]),
    ("economics", &["market", "trade", "capital", "price", "labour", "labor", "wages"]),
    ("medicine", &["disease", "patient", "physician", "treatment", "symptom", "clinical"]),
    ("religion", &["god", "church", "scripture", "faith", "divine", "sacred"]),
    ("politics", &["government", "parliament", "election", "sovereign", "citizen", "state"]),
    ("computing", &["computer", "software", "algorithm", "network", "program", "data"]),
];

/// Profile every document of the run's experiment and persist the summary.
pub async fn run(
    ctx: &StageContext,
    run: &OrchestrationRun,
) -> Result<AnalysisSummary, OrchestrationError> {
    let started_at = timestamp();
    let bundle = ctx.documents.load_experiment(run.experiment_id).await?;
    let summary = summarize(&bundle)?;

    let value = serde_json::to_value(&summary).map_err(anyhow::Error::from)?;
    let recorded = ctx
        .provenance
        .record(
            ActivityDescriptor::new(
                &run.run_id,
                run.experiment_id,
                "analyze",
                RunStage::Analyzing,
                started_at,
            )
            .with_metadata(serde_json::json!({ "documents": summary.documents.len() })),
            vec![EntityDescriptor::new(
                "analysis_summary",
                format!("analysis of experiment {}", run.experiment_id),
                value,
            )],
            AgentDescriptor::software(ANALYZER_AGENT),
        )
        .await;
    let entity = recorded.and_then(|r| r.entity_ids.into_iter().next());

    let run_id = run.run_id.clone();
    let stored = summary.clone();
    ctx.db(move |db| db.save_analysis(&run_id, &stored, entity.as_deref()))
        .await?;

    tracing::info!(
        run_id = %run.run_id,
        stage = "analyzing",
        documents = summary.documents.len(),
        "analysis complete"
    );
    Ok(summary)
}

/// Build the analysis summary. Zero documents or an unreadable document
/// is an input error.
pub fn summarize(bundle: &ExperimentBundle) -> Result<AnalysisSummary, OrchestrationError> {
    if bundle.documents.is_empty() {
        return Err(OrchestrationError::Input(format!(
            "Experiment {} has no documents",
            bundle.experiment.id
        )));
    }

    let target = bundle.experiment.target_term.as_deref();
    let documents = bundle
        .documents
        .iter()
        .map(|doc| profile(doc, target))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AnalysisSummary {
        experiment_id: bundle.experiment.id,
        experiment_goal: bundle.experiment.goal.clone(),
        target_term: bundle.experiment.target_term.clone(),
        documents,
    })
}

pub fn profile(doc: &Document, target_term: Option<&str>) -> Result<DocumentProfile, OrchestrationError> {
    let content = doc.content.trim();
    if content.is_empty() || (content.contains('\u{FFFD}') && clean_share(content) < 0.5) {
        return Err(OrchestrationError::Input(format!(
            "Document {} ('{}') has no readable text",
            doc.id, doc.title
        )));
    }

    let tokens: Vec<&str> = content.split_whitespace().collect();
    let ocr_quality = clean_share(content);
    let lowered = content.to_lowercase();

    let mut domain_hints: Vec<(usize, &str)> = DOMAIN_LEXICON
        .iter()
        .filter_map(|(domain, words)| {
            let hits = tokens
                .iter()
                .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
                .filter(|t| words.contains(&t.as_str()))
                .count();
            (hits >= 2).then_some((hits, *domain))
        })
        .collect();
    domain_hints.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    Ok(DocumentProfile {
        document_id: doc.id,
        title: doc.title.clone(),
        publication_year: doc.publication_year,
        word_count: tokens.len(),
        char_count: content.chars().count(),
        ocr_quality: (ocr_quality * 1000.0).round() / 1000.0,
        ocr_suspect: ocr_quality < OCR_SUSPECT_THRESHOLD,
        domain_hints: domain_hints.into_iter().map(|(_, d)| d.to_string()).collect(),
        mentions_target: target_term
            .is_some_and(|t| !t.is_empty() && lowered.contains(&t.to_lowercase())),
    })
}

/// Share of whitespace-separated tokens that look like clean words or numbers.
fn clean_share(text: &str) -> f64 {
    let mut total = 0usize;
    let mut clean = 0usize;
    for token in text.split_whitespace() {
        total += 1;
        if CLEAN_TOKEN_RE.is_match(token) {
            clean += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    clean as f64 / total as f64
}
