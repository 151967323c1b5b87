//! Built-in processing tools for the Execute stage.
//!
//! Every tool is deterministic and works on one document at a time. Tools
//! that run after `segmentation` in a document's plan receive its segments;
//! otherwise they work on the whole text.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::models::{Document, ToolKind};

/// Everything a tool may read for one invocation.
#[derive(Debug, Clone)]
pub struct ToolInput {
    pub document: Document,
    pub target_term: Option<String>,
    /// Output of an earlier `segmentation` invocation for this document.
    pub segments: Option<Vec<Segment>>,
}

impl ToolInput {
    /// Sentences to scan: the segments when present, else the whole text.
    fn passages(&self) -> Vec<&str> {
        match &self.segments {
            Some(segments) => segments.iter().map(|s| s.text.as_str()).collect(),
            None => vec![self.document.content.as_str()],
        }
    }
}

/// Seam between the Execute stage and the tool implementations.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, tool: ToolKind, input: &ToolInput) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    /// Byte offsets into the document content.
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Pull segments back out of a `segmentation` artifact.
pub fn segments_from_artifact(artifact: &serde_json::Value) -> Option<Vec<Segment>> {
    serde_json::from_value(artifact.get("segments")?.clone()).ok()
}

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("valid sentence regex"));
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-z]+(?:\s+(?:of\s+)?[A-Z][a-z]+)*\b").expect("valid entity regex")
});
static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1[0-9]{3}|20[0-9]{2})('?s)?\b").expect("valid year regex"));
static CENTURY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)[\s-]+century\b").expect("valid century regex")
});
static DEFINITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z][a-z'-]*(?:\s+[a-z][a-z'-]*){0,3})\s+(is defined as|are defined as|means|refers to|denotes)\s+([^.;!?]+)")
        .expect("valid definition regex")
});
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid word regex"));

/// Capitalised words that start sentences far more often than they name things.
const ENTITY_STOPWORDS: &[&str] = &[
    "A", "An", "And", "As", "At", "But", "By", "For", "He", "Her", "His", "However", "If", "In",
    "It", "Its", "On", "Our", "She", "So", "That", "The", "Their", "There", "These", "They",
    "This", "Those", "To", "We", "When", "While", "With",
];

/// The default implementation of every registry tool.
#[derive(Debug, Clone)]
pub struct BuiltinTools {
    pub embedding_dimensions: usize,
}

impl Default for BuiltinTools {
    fn default() -> Self {
        Self {
            embedding_dimensions: 256,
        }
    }
}

#[async_trait]
impl ToolRunner for BuiltinTools {
    async fn run(&self, tool: ToolKind, input: &ToolInput) -> Result<serde_json::Value> {
        if input.document.content.trim().is_empty() {
            bail!("document {} has no text", input.document.id);
        }
        match tool {
            ToolKind::Segmentation => Ok(segment(&input.document.content)),
            ToolKind::EntityExtraction => Ok(extract_entities(input)),
            ToolKind::TemporalExtraction => Ok(extract_temporal(input)),
            ToolKind::DefinitionExtraction => Ok(extract_definitions(input)),
            ToolKind::EmbeddingGeneration => embed(&input.document.content, self.embedding_dimensions),
        }
    }
}

fn segment(text: &str) -> serde_json::Value {
    let mut segments = Vec::new();
    for m in SENTENCE_RE.find_iter(text) {
        let raw = m.as_str();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lead = raw.len() - raw.trim_start().len();
        let start = m.start() + lead;
        segments.push(Segment {
            index: segments.len(),
            start,
            end: start + trimmed.len(),
            text: trimmed.to_string(),
        });
    }
    serde_json::json!({
        "count": segments.len(),
        "segments": segments,
    })
}

fn extract_entities(input: &ToolInput) -> serde_json::Value {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for passage in input.passages() {
        for m in ENTITY_RE.find_iter(passage) {
            let mut text = m.as_str();
            // "The Royal Society" at a sentence start names "Royal Society".
            if let Some((first, rest)) = text.split_once(char::is_whitespace)
                && ENTITY_STOPWORDS.contains(&first)
            {
                text = rest.trim_start();
            }
            if ENTITY_STOPWORDS.contains(&text) {
                continue;
            }
            *counts.entry(text.to_string()).or_default() += 1;
        }
    }
    let mut entities: Vec<(String, usize)> = counts.into_iter().collect();
    entities.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let entities: Vec<serde_json::Value> = entities
        .into_iter()
        .map(|(text, count)| serde_json::json!({"text": text, "count": count}))
        .collect();
    serde_json::json!({
        "count": entities.len(),
        "entities": entities,
    })
}

fn extract_temporal(input: &ToolInput) -> serde_json::Value {
    let mut expressions = Vec::new();
    for passage in input.passages() {
        for caps in YEAR_RE.captures_iter(passage) {
            let year: i32 = caps[1].parse().unwrap_or_default();
            let decade = caps.get(2).is_some();
            expressions.push(serde_json::json!({
                "text": &caps[0],
                "kind": if decade { "decade" } else { "year" },
                "normalized_year": if decade { year - year % 10 } else { year },
            }));
        }
        for caps in CENTURY_RE.captures_iter(passage) {
            let century: i32 = caps[1].parse().unwrap_or_default();
            expressions.push(serde_json::json!({
                "text": &caps[0],
                "kind": "century",
                "normalized_year": (century - 1) * 100,
            }));
        }
    }
    let mut years: Vec<i64> = expressions
        .iter()
        .filter_map(|e| e["normalized_year"].as_i64())
        .collect();
    years.sort_unstable();
    serde_json::json!({
        "count": expressions.len(),
        "earliest_year": years.first(),
        "latest_year": years.last(),
        "expressions": expressions,
    })
}

fn extract_definitions(input: &ToolInput) -> serde_json::Value {
    let target = input.target_term.as_deref().map(str::to_lowercase);
    let mut definitions = Vec::new();
    for passage in input.passages() {
        for caps in DEFINITION_RE.captures_iter(passage) {
            let term = caps[1].trim().to_string();
            let definition = caps[3].trim().to_string();
            let mentions_target = target.as_ref().is_some_and(|t| {
                term.to_lowercase().contains(t.as_str())
                    || definition.to_lowercase().contains(t.as_str())
            });
            definitions.push(serde_json::json!({
                "term": term,
                "cue": caps[2].to_lowercase(),
                "definition": definition,
                "mentions_target": mentions_target,
            }));
        }
    }
    serde_json::json!({
        "count": definitions.len(),
        "definitions": definitions,
    })
}

/// Feature-hashed bag of words: each token lands in a SHA-256-chosen
/// bucket with a hash-chosen sign, then the vector is L2-normalised.
fn embed(text: &str, dimensions: usize) -> Result<serde_json::Value> {
    if dimensions == 0 {
        bail!("embedding dimension must be greater than 0");
    }
    let mut vector = vec![0f64; dimensions];
    let mut token_count = 0usize;
    for word in WORD_RE.find_iter(text) {
        let token = word.as_str().to_lowercase();
        let hash = Sha256::digest(token.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&hash[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % dimensions as u64) as usize;
        let sign = if hash[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
        token_count += 1;
    }
    if token_count == 0 {
        bail!("no tokens to embed");
    }
    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    Ok(serde_json::json!({
        "dimensions": dimensions,
        "token_count": token_count,
        "vector": vector,
    }))
}
