//! Record helpers used to seed the store. Each returns the stored document.

use crate::errors::{StoreError, TaskError};
use crate::fingerprint;
use crate::model::{
    Author, Benchmark, Evaluation, EvaluationMeta, EvaluationStatus, Judgement, Scenario,
    Strategy, Workspace,
};
use crate::storage::{Collection, DocumentStore};
use chrono::Utc;
use std::collections::BTreeMap;

async fn fetch<T: serde::de::DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: Collection,
    id: &str,
) -> anyhow::Result<T> {
    let doc = store
        .get(collection, id)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            collection: collection.as_str().to_string(),
            id: id.to_string(),
        })?;
    doc.parse()
}

async fn save<T: serde::Serialize>(
    store: &dyn DocumentStore,
    collection: Collection,
    id: &str,
    record: &T,
) -> anyhow::Result<i64> {
    store
        .put(collection, id, &serde_json::to_value(record)?)
        .await
}

pub async fn create_workspace(store: &dyn DocumentStore, workspace: &Workspace) -> anyhow::Result<()> {
    save(store, Collection::Workspaces, &workspace.id, workspace).await?;
    Ok(())
}

/// Stores a scenario under its content-addressed id. Params default to the value keys.
pub async fn create_scenario(
    store: &dyn DocumentStore,
    workspace_id: &str,
    name: &str,
    values: BTreeMap<String, String>,
    tags: Vec<String>,
) -> anyhow::Result<Scenario> {
    let scenario = Scenario {
        id: fingerprint::scenario_id(workspace_id, &values),
        workspace_id: workspace_id.to_string(),
        name: name.to_string(),
        params: values.keys().cloned().collect(),
        values,
        tags,
    };
    save(store, Collection::Scenarios, &scenario.id, &scenario).await?;
    Ok(scenario)
}

/// Stores a strategy. Declared params must be exactly the params the template references;
/// an empty list is filled from the template.
pub async fn create_strategy(store: &dyn DocumentStore, mut strategy: Strategy) -> anyhow::Result<Strategy> {
    let referenced = Strategy::params_from_template(&strategy.template);
    if strategy.params.is_empty() {
        strategy.params = referenced;
    } else {
        let mut declared = strategy.params.clone();
        declared.sort();
        declared.dedup();
        if declared != referenced {
            return Err(TaskError::InvalidStrategy {
                id: strategy.id.clone(),
                reason: format!(
                    "declared params [{}] do not match template params [{}]",
                    declared.join(", "),
                    referenced.join(", ")
                ),
            }
            .into());
        }
        strategy.params = declared;
    }
    if strategy.params.is_empty() {
        return Err(TaskError::InvalidStrategy {
            id: strategy.id.clone(),
            reason: "template references no params".into(),
        }
        .into());
    }
    save(store, Collection::Strategies, &strategy.id, &strategy).await?;
    Ok(strategy)
}

/// Upserts the single judgement for (workspace, scenario, index, doc). Setting it again
/// replaces the rating.
pub async fn set_judgement(
    store: &dyn DocumentStore,
    workspace_id: &str,
    scenario_id: &str,
    index: &str,
    doc_id: &str,
    rating: i64,
    author: Author,
) -> anyhow::Result<Judgement> {
    let workspace: Workspace = fetch(store, Collection::Workspaces, workspace_id).await?;
    let scale = workspace.rating_scale;
    if !scale.contains(rating) {
        return Err(TaskError::RatingOutOfScale {
            rating,
            min: scale.min,
            max: scale.max,
        }
        .into());
    }

    let judgement = Judgement {
        id: fingerprint::judgement_id(workspace_id, scenario_id, index, doc_id),
        workspace_id: workspace_id.to_string(),
        scenario_id: scenario_id.to_string(),
        index: index.to_string(),
        doc_id: doc_id.to_string(),
        rating,
        author,
        timestamp: Utc::now(),
    };
    save(store, Collection::Judgements, &judgement.id, &judgement).await?;
    tracing::debug!(
        event = "judgement.set",
        judgement_id = %judgement.id,
        rating,
    );
    Ok(judgement)
}

pub async fn create_benchmark(store: &dyn DocumentStore, benchmark: &Benchmark) -> anyhow::Result<()> {
    save(store, Collection::Benchmarks, &benchmark.id, benchmark).await?;
    Ok(())
}

/// Queues a `pending` evaluation carrying a copy of the benchmark's task.
pub async fn create_evaluation(store: &dyn DocumentStore, benchmark_id: &str) -> anyhow::Result<Evaluation> {
    let benchmark: Benchmark = fetch(store, Collection::Benchmarks, benchmark_id).await?;
    let evaluation = Evaluation {
        id: uuid::Uuid::new_v4().to_string(),
        workspace_id: benchmark.workspace_id,
        benchmark_id: benchmark.id,
        task: benchmark.task,
        meta: EvaluationMeta {
            status: EvaluationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        },
        strategy_id: Vec::new(),
        scenario_id: Vec::new(),
        results: None,
        runtime: None,
        unrated_docs: None,
        took: None,
        error: None,
    };
    save(store, Collection::Evaluations, &evaluation.id, &evaluation).await?;
    tracing::info!(
        event = "evaluation.queued",
        evaluation_id = %evaluation.id,
        benchmark_id = %evaluation.benchmark_id,
    );
    Ok(evaluation)
}
