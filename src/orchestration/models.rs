use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a document in the experiment store.
pub type DocumentId = i64;

/// Per-document ordered tool plan. Keys serialize as JSON strings.
pub type DocumentPlan = BTreeMap<DocumentId, Vec<ToolKind>>;

// ── Run lifecycle ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Analyzing,
    Recommending,
    Reviewing,
    Executing,
    Synthesizing,
    Completed,
}

impl RunStage {
    pub const ALL: [RunStage; 6] = [
        RunStage::Analyzing,
        RunStage::Recommending,
        RunStage::Reviewing,
        RunStage::Executing,
        RunStage::Synthesizing,
        RunStage::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Recommending => "recommending",
            Self::Reviewing => "reviewing",
            Self::Executing => "executing",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
        }
    }

    /// The stage that follows this one, or `None` once completed.
    pub fn next(&self) -> Option<RunStage> {
        match self {
            Self::Analyzing => Some(Self::Recommending),
            Self::Recommending => Some(Self::Reviewing),
            Self::Reviewing => Some(Self::Executing),
            Self::Executing => Some(Self::Synthesizing),
            Self::Synthesizing => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// Progress reported when a run enters this stage.
    pub fn entry_progress(&self) -> u8 {
        match self {
            Self::Analyzing => 5,
            Self::Recommending => 20,
            Self::Reviewing => 40,
            Self::Executing => 45,
            Self::Synthesizing => 90,
            Self::Completed => 100,
        }
    }

    /// Coarse status a run carries while sitting in this stage.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Reviewing => RunStatus::Reviewing,
            Self::Completed => RunStatus::Completed,
            _ => RunStatus::Running,
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("Invalid run stage: {}", s))
    }
}

/// Validate that a stage transition follows the pipeline order.
pub fn is_valid_transition(from: RunStage, to: RunStage) -> bool {
    from.next() == Some(to)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Reviewing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "reviewing" => Ok(Self::Reviewing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One invocation of the five-stage workflow for one experiment.
///
/// When a stage fails, `status` becomes `failed` and `current_stage`
/// keeps naming the stage that failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub run_id: String,
    pub experiment_id: i64,
    pub current_stage: RunStage,
    pub status: RunStatus,
    pub progress_percentage: u8,
    pub review_choices: bool,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub error_message: Option<String>,
}

impl OrchestrationRun {
    /// Wall-clock seconds from start to end (or to `now` while running).
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = DateTime::parse_from_rfc3339(&self.started_at).ok()?;
        let ended = match &self.ended_at {
            Some(ended) => DateTime::parse_from_rfc3339(ended).ok()?.with_timezone(&Utc),
            None => now,
        };
        let millis = (ended - started.with_timezone(&Utc)).num_milliseconds().max(0);
        Some(millis as f64 / 1000.0)
    }
}

// ── Tool registry ─────────────────────────────────────────────────────

/// The fixed registry of processing tools a strategy may reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Segmentation,
    EntityExtraction,
    TemporalExtraction,
    DefinitionExtraction,
    EmbeddingGeneration,
}

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::Segmentation,
        ToolKind::EntityExtraction,
        ToolKind::TemporalExtraction,
        ToolKind::DefinitionExtraction,
        ToolKind::EmbeddingGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::EntityExtraction => "entity_extraction",
            Self::TemporalExtraction => "temporal_extraction",
            Self::DefinitionExtraction => "definition_extraction",
            Self::EmbeddingGeneration => "embedding_generation",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Segmentation => "split text into sentence segments",
            Self::EntityExtraction => "find named entities (people, places, organisations)",
            Self::TemporalExtraction => "find years, decades and centuries mentioned",
            Self::DefinitionExtraction => "find explicit definitions of terms",
            Self::EmbeddingGeneration => "compute a document vector for similarity",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = ToolKind::ALL.iter().map(|t| t.as_str()).collect();
                format!("Unknown tool '{}'. Valid tools: {}", s, valid.join(", "))
            })
    }
}

// ── Experiments & documents ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub name: String,
    pub goal: String,
    pub target_term: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub experiment_id: i64,
    pub title: String,
    pub content: String,
    pub publication_year: Option<i32>,
    pub created_at: String,
}

/// An experiment together with the documents it analyses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentBundle {
    pub experiment: Experiment,
    pub documents: Vec<Document>,
}

// ── Stage outputs ─────────────────────────────────────────────────────

/// Characteristics of one document relevant to tool selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentProfile {
    pub document_id: DocumentId,
    pub title: String,
    pub publication_year: Option<i32>,
    pub word_count: usize,
    pub char_count: usize,
    /// Share of tokens that look like clean words (0.0–1.0).
    pub ocr_quality: f64,
    pub ocr_suspect: bool,
    pub domain_hints: Vec<String>,
    pub mentions_target: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSummary {
    pub experiment_id: i64,
    pub experiment_goal: String,
    pub target_term: Option<String>,
    pub documents: Vec<DocumentProfile>,
}

impl AnalysisSummary {
    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.documents.iter().map(|d| d.document_id).collect()
    }
}

/// The machine-proposed plan produced by the Recommend stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyRecommendation {
    pub documents_to_tools: DocumentPlan,
    pub confidence: f64,
    pub reasoning: String,
}

/// Human input captured at the review gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_strategy: Option<DocumentPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
}

/// A review decision as persisted in the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewRecord {
    pub decision: ReviewDecision,
    pub decided_at: String,
    pub auto_approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisReport {
    pub narrative: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub semantic_shifts: Vec<SemanticShift>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticShift {
    pub period: String,
    pub description: String,
}

/// Durable snapshot of everything a run has produced so far.
///
/// Entity ids link later provenance records to the artifacts of earlier
/// stages; they are absent when the provenance write failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub analysis: Option<AnalysisSummary>,
    pub analysis_entity: Option<String>,
    pub recommendation: Option<StrategyRecommendation>,
    pub recommendation_entity: Option<String>,
    pub review: Option<ReviewRecord>,
    pub strategy_entity: Option<String>,
    pub synthesis: Option<SynthesisReport>,
}

impl Checkpoint {
    /// The plan Execute must run: the reviewer's modification if one was
    /// submitted, otherwise the original recommendation. Never a merge.
    pub fn effective_strategy(&self) -> Option<&DocumentPlan> {
        if let Some(modified) = self
            .review
            .as_ref()
            .and_then(|r| r.decision.modified_strategy.as_ref())
        {
            return Some(modified);
        }
        self.recommendation.as_ref().map(|r| &r.documents_to_tools)
    }
}

// ── Execute ledger ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Succeeded,
    Failed,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for InvocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid invocation status: {}", s)),
        }
    }
}

/// Outcome of one (document, tool) invocation during Execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub run_id: String,
    pub document_id: DocumentId,
    pub tool: ToolKind,
    pub status: InvocationStatus,
    pub artifact: Option<serde_json::Value>,
    pub error: Option<String>,
    pub activity_id: Option<String>,
    pub entity_id: Option<String>,
    pub completed_at: String,
}

// ── API view types ────────────────────────────────────────────────────

/// The polling contract: everything a client needs to render progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: String,
    pub experiment_id: i64,
    pub current_stage: RunStage,
    pub status: RunStatus,
    pub progress_percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_goal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_strategy: Option<DocumentPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_strategy: Option<DocumentPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl RunStatusView {
    pub fn build(run: OrchestrationRun, checkpoint: Checkpoint, now: DateTime<Utc>) -> Self {
        let duration_seconds = run.duration_seconds(now);
        let recommendation = checkpoint.recommendation;
        Self {
            run_id: run.run_id,
            experiment_id: run.experiment_id,
            current_stage: run.current_stage,
            status: run.status,
            progress_percentage: run.progress_percentage,
            error_message: run.error_message,
            experiment_goal: checkpoint.analysis.map(|a| a.experiment_goal),
            confidence: recommendation.as_ref().map(|r| r.confidence),
            strategy_reasoning: recommendation.as_ref().map(|r| r.reasoning.clone()),
            recommended_strategy: recommendation.map(|r| r.documents_to_tools),
            modified_strategy: checkpoint
                .review
                .and_then(|r| r.decision.modified_strategy),
            synthesis: checkpoint.synthesis,
            duration_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_linear() {
        let mut stage = RunStage::Analyzing;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            assert!(is_valid_transition(stage, next));
            stage = next;
            visited.push(stage);
        }
        assert_eq!(visited, RunStage::ALL.to_vec());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!is_valid_transition(RunStage::Recommending, RunStage::Executing));
        assert!(!is_valid_transition(RunStage::Reviewing, RunStage::Reviewing));
        assert!(!is_valid_transition(RunStage::Completed, RunStage::Analyzing));
        assert!(!is_valid_transition(RunStage::Synthesizing, RunStage::Executing));
    }

    #[test]
    fn test_entry_progress_is_monotonic() {
        let progress: Vec<u8> = RunStage::ALL.iter().map(|s| s.entry_progress()).collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*progress.last().unwrap(), 100);
    }

    #[test]
    fn test_stage_status_mapping() {
        assert_eq!(RunStage::Analyzing.status(), RunStatus::Running);
        assert_eq!(RunStage::Reviewing.status(), RunStatus::Reviewing);
        assert_eq!(RunStage::Executing.status(), RunStatus::Running);
        assert_eq!(RunStage::Completed.status(), RunStatus::Completed);
    }

    #[test]
    fn test_stage_round_trips_through_str() {
        for stage in RunStage::ALL {
            assert_eq!(stage.as_str().parse::<RunStage>().unwrap(), stage);
        }
        assert!("failed".parse::<RunStage>().is_err());
    }

    #[test]
    fn test_unknown_tool_lists_registry() {
        let err = "ocr_cleanup".parse::<ToolKind>().unwrap_err();
        assert!(err.contains("ocr_cleanup"));
        assert!(err.contains("segmentation"));
        assert!(err.contains("embedding_generation"));
    }

    #[test]
    fn test_document_plan_json_uses_string_keys() {
        let mut plan = DocumentPlan::new();
        plan.insert(7, vec![ToolKind::Segmentation, ToolKind::EntityExtraction]);
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"7": ["segmentation", "entity_extraction"]})
        );
        let back: DocumentPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_effective_strategy_prefers_modification() {
        let mut original = DocumentPlan::new();
        original.insert(1, vec![ToolKind::Segmentation]);
        original.insert(2, vec![ToolKind::Segmentation]);
        let mut modified = DocumentPlan::new();
        modified.insert(1, vec![ToolKind::EmbeddingGeneration]);

        let mut checkpoint = Checkpoint {
            recommendation: Some(StrategyRecommendation {
                documents_to_tools: original.clone(),
                confidence: 0.8,
                reasoning: "r".into(),
            }),
            ..Default::default()
        };
        assert_eq!(checkpoint.effective_strategy(), Some(&original));

        checkpoint.review = Some(ReviewRecord {
            decision: ReviewDecision {
                approved: true,
                modified_strategy: Some(modified.clone()),
                review_notes: None,
            },
            decided_at: Utc::now().to_rfc3339(),
            auto_approved: false,
        });
        assert_eq!(checkpoint.effective_strategy(), Some(&modified));

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_duration_uses_end_time_when_present() {
        let run = OrchestrationRun {
            run_id: "r".into(),
            experiment_id: 1,
            current_stage: RunStage::Completed,
            status: RunStatus::Completed,
            progress_percentage: 100,
            review_choices: true,
            started_at: "2026-01-01T10:00:00+00:00".into(),
            ended_at: Some("2026-01-01T10:01:30+00:00".into()),
            error_message: None,
        };
        assert_eq!(run.duration_seconds(Utc::now()), Some(90.0));
    }
}
