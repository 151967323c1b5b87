//! PROV-O provenance: descriptors written by the stages, read models
//! served to auditors, and the recorder that never fails its caller.
//!
//! Every Activity is associated with exactly one Agent, every Entity is
//! generated by exactly one Activity, and `wasDerivedFrom` links form a
//! DAG. The store rejects a derivation that would close a cycle and its
//! triggers refuse updates and deletes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::db::DbHandle;
use super::models::RunStage;

// ── Write-side descriptors ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Software,
    LanguageModel,
    Person,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Software => "software",
            Self::LanguageModel => "language_model",
            Self::Person => "person",
        }
    }

    /// PROV-O class used in the serialized graph.
    pub fn prov_type(&self) -> &'static str {
        match self {
            Self::Software | Self::LanguageModel => "prov:SoftwareAgent",
            Self::Person => "prov:Person",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "software" => Ok(Self::Software),
            "language_model" => Ok(Self::LanguageModel),
            "person" => Ok(Self::Person),
            _ => Err(format!("Invalid agent kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub kind: AgentKind,
    pub label: String,
}

impl AgentDescriptor {
    pub fn software(label: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::Software,
            label: label.into(),
        }
    }

    pub fn language_model(model: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::LanguageModel,
            label: model.into(),
        }
    }

    pub fn person(label: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::Person,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActivityOutcome {
    Succeeded,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDescriptor {
    pub run_id: String,
    pub experiment_id: i64,
    /// e.g. `analyze`, `recommend`, `review`, `tool:segmentation`, `synthesize`.
    pub activity_type: String,
    pub stage: RunStage,
    pub started_at: String,
    pub ended_at: String,
    pub outcome: ActivityOutcome,
    pub metadata: serde_json::Value,
}

impl ActivityDescriptor {
    pub fn new(
        run_id: &str,
        experiment_id: i64,
        activity_type: impl Into<String>,
        stage: RunStage,
        started_at: String,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            experiment_id,
            activity_type: activity_type.into(),
            stage,
            started_at,
            ended_at: Utc::now().to_rfc3339(),
            outcome: ActivityOutcome::Succeeded,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.outcome = ActivityOutcome::Failed {
            error: error.into(),
        };
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity_type: String,
    pub label: String,
    pub value: serde_json::Value,
    pub derived_from: Vec<String>,
}

impl EntityDescriptor {
    pub fn new(
        entity_type: impl Into<String>,
        label: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            label: label.into(),
            value,
            derived_from: Vec::new(),
        }
    }

    /// Add upstream entities; missing ids (failed earlier writes) are skipped.
    pub fn derived_from<I>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        self.derived_from.extend(upstream.into_iter().flatten());
        self
    }

    /// SHA-256 of the canonical JSON value, hex encoded.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.value).unwrap_or_default();
        Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Identifiers assigned by one `record` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedActivity {
    pub activity_id: String,
    pub agent_id: String,
    pub entity_ids: Vec<String>,
}

// ── Read models ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub kind: AgentKind,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_id: String,
    pub run_id: String,
    pub experiment_id: i64,
    pub activity_type: String,
    pub stage: RunStage,
    pub agent_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub status: String,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl ActivityRecord {
    pub fn failed(&self) -> bool {
        self.status == "failed"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub run_id: String,
    pub entity_type: String,
    pub label: String,
    pub activity_id: String,
    pub digest: String,
    pub value: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    pub entity_id: String,
    pub derived_from: String,
}

/// All provenance for one run (or one experiment).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvenanceBundle {
    pub agents: Vec<AgentRecord>,
    pub activities: Vec<ActivityRecord>,
    pub entities: Vec<EntityRecord>,
    pub derivations: Vec<Derivation>,
}

impl ProvenanceBundle {
    /// True when following `wasDerivedFrom` never revisits an entity.
    pub fn is_acyclic(&self) -> bool {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for d in &self.derivations {
            edges
                .entry(d.entity_id.as_str())
                .or_default()
                .push(d.derived_from.as_str());
        }

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();
        for start in edges.keys().copied() {
            if state.get(start).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            state.insert(start, 1);
            while let Some((node, idx)) = stack.pop() {
                let next = edges.get(node).and_then(|n| n.get(idx)).copied();
                match next {
                    Some(child) => {
                        stack.push((node, idx + 1));
                        match state.get(child).copied().unwrap_or(0) {
                            1 => return false,
                            0 => {
                                state.insert(child, 1);
                                stack.push((child, 0));
                            }
                            _ => {}
                        }
                    }
                    None => {
                        state.insert(node, 2);
                    }
                }
            }
        }
        true
    }

    /// Activities generated for one tool invocation, keyed by document id.
    pub fn tool_activities(&self) -> Vec<&ActivityRecord> {
        self.activities
            .iter()
            .filter(|a| a.activity_type.starts_with("tool:"))
            .collect()
    }

    /// Serialize as a PROV-JSON document.
    pub fn to_prov_json(&self) -> serde_json::Value {
        let mut agent = BTreeMap::new();
        for a in &self.agents {
            agent.insert(
                format!("ontx:agent/{}", a.agent_id),
                serde_json::json!({
                    "prov:type": a.kind.prov_type(),
                    "prov:label": a.label,
                    "ontx:kind": a.kind.as_str(),
                }),
            );
        }

        let mut activity = BTreeMap::new();
        let mut was_associated_with = BTreeMap::new();
        for a in &self.activities {
            let key = format!("ontx:activity/{}", a.activity_id);
            activity.insert(
                key.clone(),
                serde_json::json!({
                    "prov:type": a.activity_type,
                    "prov:startTime": a.started_at,
                    "prov:endTime": a.ended_at,
                    "ontx:stage": a.stage.as_str(),
                    "ontx:status": a.status,
                    "ontx:error": a.error,
                    "ontx:metadata": a.metadata,
                }),
            );
            was_associated_with.insert(
                format!("_:assoc/{}", a.activity_id),
                serde_json::json!({
                    "prov:activity": key,
                    "prov:agent": format!("ontx:agent/{}", a.agent_id),
                }),
            );
        }

        let mut entity = BTreeMap::new();
        let mut was_generated_by = BTreeMap::new();
        for e in &self.entities {
            let key = format!("ontx:entity/{}", e.entity_id);
            entity.insert(
                key.clone(),
                serde_json::json!({
                    "prov:type": e.entity_type,
                    "prov:label": e.label,
                    "ontx:digest": e.digest,
                    "prov:generatedAtTime": e.created_at,
                }),
            );
            was_generated_by.insert(
                format!("_:gen/{}", e.entity_id),
                serde_json::json!({
                    "prov:entity": key,
                    "prov:activity": format!("ontx:activity/{}", e.activity_id),
                }),
            );
        }

        let mut was_derived_from = BTreeMap::new();
        for (i, d) in self.derivations.iter().enumerate() {
            was_derived_from.insert(
                format!("_:der/{}", i),
                serde_json::json!({
                    "prov:generatedEntity": format!("ontx:entity/{}", d.entity_id),
                    "prov:usedEntity": format!("ontx:entity/{}", d.derived_from),
                }),
            );
        }

        serde_json::json!({
            "prefix": {
                "prov": "http://www.w3.org/ns/prov#",
                "ontx": "urn:ontextract:",
            },
            "agent": agent,
            "activity": activity,
            "entity": entity,
            "wasAssociatedWith": was_associated_with,
            "wasGeneratedBy": was_generated_by,
            "wasDerivedFrom": was_derived_from,
        })
    }
}

// ── Recorder ──────────────────────────────────────────────────────────

/// Append-only provenance writer shared by every stage.
///
/// Provenance is audit data: a failed write is logged and reported as
/// `None`, and the substantive operation carries on.
#[derive(Clone)]
pub struct ProvenanceRecorder {
    db: DbHandle,
}

impl ProvenanceRecorder {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        activity: ActivityDescriptor,
        entities: Vec<EntityDescriptor>,
        agent: AgentDescriptor,
    ) -> Option<RecordedActivity> {
        let run_id = activity.run_id.clone();
        let activity_type = activity.activity_type.clone();
        let result = self
            .db
            .call(move |db| db.insert_provenance(&agent, &activity, &entities))
            .await;
        match result {
            Ok(recorded) => {
                tracing::debug!(
                    run_id = %run_id,
                    activity = %activity_type,
                    activity_id = %recorded.activity_id,
                    entities = recorded.entity_ids.len(),
                    "provenance recorded"
                );
                Some(recorded)
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    activity = %activity_type,
                    "provenance write failed: {:#}",
                    e
                );
                None
            }
        }
    }
}

/// Collect the set of entity ids reachable from `start` via `wasDerivedFrom`.
pub(crate) fn ancestors<F>(start: &str, mut upstream_of: F) -> anyhow::Result<HashSet<String>>
where
    F: FnMut(&str) -> anyhow::Result<Vec<String>>,
{
    let mut seen = HashSet::new();
    let mut frontier = vec![start.to_string()];
    while let Some(node) = frontier.pop() {
        for parent in upstream_of(&node)? {
            if seen.insert(parent.clone()) {
                frontier.push(parent);
            }
        }
    }
    Ok(seen)
}
