use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatingScale {
    pub min: i64,
    pub max: i64,
}

impl RatingScale {
    pub fn contains(&self, rating: i64) -> bool {
        rating >= self.min && rating <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub index_pattern: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub rating_scale: RatingScale,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub values: BTreeMap<String, String>,
    /// Sorted keys of `values`.
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Query or retriever definition passed verbatim to the scoring operation.
    pub template: serde_json::Value,
}

impl Strategy {
    /// Mustache variables referenced anywhere in the template, sorted and de-duplicated.
    pub fn params_from_template(template: &serde_json::Value) -> Vec<String> {
        let re = mustache_var_regex();
        let raw = template.to_string();
        let found: BTreeSet<String> = re
            .captures_iter(&raw)
            .map(|c| c[1].to_string())
            .collect();
        found.into_iter().collect()
    }
}

fn mustache_var_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\{\{\{?\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}?\}\}")
            .expect("static mustache pattern")
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    Human,
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgement {
    pub id: String,
    pub workspace_id: String,
    pub scenario_id: String,
    pub index: String,
    pub doc_id: String,
    pub rating: i64,
    pub author: Author,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub task: Task,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    #[default]
    Subset,
}

impl MatchMode {
    pub fn matches(&self, strategy_params: &BTreeSet<String>, scenario_params: &BTreeSet<String>) -> bool {
        match self {
            MatchMode::Exact => strategy_params == scenario_params,
            MatchMode::Subset => strategy_params.is_subset(scenario_params),
        }
    }
}

/// A reusable query over the strategy/scenario space of a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    /// Raw metric names; validated by the runner so malformed tasks can still be failed.
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub k: i64,
    #[serde(default)]
    pub strategies: StrategiesTask,
    #[serde(default)]
    pub scenarios: ScenariosTask,
    #[serde(default)]
    pub match_mode: MatchMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategiesTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Literal strategy documents; when present they are used instead of a store lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<Vec<Strategy>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenariosTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Running => "running",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
            EvaluationStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvaluationStatus::Completed | EvaluationStatus::Failed | EvaluationStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMeta {
    pub status: EvaluationStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub workspace_id: String,
    pub benchmark_id: String,
    pub task: Task,
    pub meta: EvaluationMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strategy_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scenario_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<StrategyResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrated_docs: Option<Vec<UnratedDoc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub took: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EvaluationError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hit {
    pub index: String,
    pub id: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatedHit {
    pub hit: Hit,
    /// `None` when the document has no judgement for the scenario.
    pub rating: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub scenario_id: String,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub hits: Vec<RatedHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy_id: String,
    pub searches: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnratedDoc {
    pub index: String,
    pub id: String,
    pub count: u64,
    pub strategies: Vec<String>,
    pub scenarios: Vec<String>,
}

/// Frozen snapshot of every document version an evaluation read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Runtime {
    #[serde(default)]
    pub strategies: BTreeMap<String, RuntimeEntry>,
    #[serde(default)]
    pub scenarios: BTreeMap<String, RuntimeEntry>,
    #[serde(default)]
    pub judgements: BTreeMap<String, RuntimeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extensions: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEntry {
    /// Absent for documents embedded in the task rather than read from the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub doc: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Store,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationError {
    pub kind: ErrorKind,
    pub message: String,
}
