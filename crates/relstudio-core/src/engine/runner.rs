use crate::candidates::{CandidatePool, CandidatePoolBuilder};
use crate::errors::{classify, StoreError, TaskError};
use crate::model::{
    Evaluation, EvaluationError, EvaluationStatus, Judgement, RatedHit, Runtime, RuntimeEntry,
    Scenario, SearchResult, Strategy, StrategyResult, Task, UnratedDoc, Workspace,
};
use crate::providers::rank_eval::{
    DocRating, Metric, RankEvalRequest, RankEvalTemplate, RankEvaluator,
};
use crate::storage::{Collection, DocumentStore, Filter, Query};
use anyhow::Context;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};

/// Ids per `_id`/`scenario_id` terms lookup.
const LOOKUP_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct RunPolicy {
    /// Extra attempts when writing the final evaluation document fails.
    pub persist_retries: u32,
    pub persist_backoff: Duration,
    /// Upper bound for one scoring round trip.
    pub scoring_timeout: Duration,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            persist_retries: 2,
            persist_backoff: Duration::from_millis(250),
            scoring_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Runner {
    pub store: Arc<dyn DocumentStore>,
    pub evaluator: Arc<dyn RankEvaluator>,
    pub policy: RunPolicy,
}

#[derive(Default)]
struct Cell {
    metrics: BTreeMap<String, f64>,
    hits: Option<Vec<RatedHit>>,
}

#[derive(Default)]
struct UnratedTally {
    count: u64,
    strategies: BTreeSet<String>,
    scenarios: BTreeSet<String>,
}

/// Checks `k` and `metrics`. Metrics are de-duplicated, first occurrence wins.
pub fn validate_task(task: &Task) -> Result<(Vec<Metric>, u32), TaskError> {
    if task.k < 1 || task.k > u32::MAX as i64 {
        return Err(TaskError::InvalidK(task.k));
    }
    if task.metrics.is_empty() {
        return Err(TaskError::NoMetrics);
    }
    let mut metrics = Vec::new();
    for name in &task.metrics {
        let m = Metric::parse(name)?;
        if !metrics.contains(&m) {
            metrics.push(m);
        }
    }
    Ok((metrics, task.k as u32))
}

impl Runner {
    pub fn new(store: Arc<dyn DocumentStore>, evaluator: Arc<dyn RankEvaluator>) -> Self {
        Self {
            store,
            evaluator,
            policy: RunPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs one evaluation to a terminal state.
    ///
    /// On error the evaluation is marked `failed` (and persisted when `persist` is set)
    /// before the error is returned to the caller.
    pub async fn run(&self, mut evaluation: Evaluation, persist: bool) -> anyhow::Result<Evaluation> {
        let clock = Instant::now();
        if evaluation.meta.started_at.is_none() {
            evaluation.meta.started_at = Some(Utc::now());
        }

        match self.execute(&mut evaluation, clock).await {
            Ok(()) => {
                tracing::info!(
                    event = "evaluation.finished",
                    evaluation_id = %evaluation.id,
                    status = evaluation.meta.status.as_str(),
                    took_ms = evaluation.took.unwrap_or(0),
                );
                if persist {
                    self.persist(&evaluation).await?;
                }
                Ok(evaluation)
            }
            Err(e) => {
                evaluation.meta.status = EvaluationStatus::Failed;
                evaluation.meta.stopped_at = Some(Utc::now());
                evaluation.took = Some(clock.elapsed().as_millis() as u64);
                evaluation.results = None;
                evaluation.error = Some(EvaluationError {
                    kind: classify(&e),
                    message: format!("{:#}", e),
                });
                tracing::warn!(
                    event = "evaluation.failed",
                    evaluation_id = %evaluation.id,
                    error = %format!("{:#}", e),
                );
                if persist {
                    if let Err(pe) = self.persist(&evaluation).await {
                        tracing::error!(
                            event = "evaluation.persist_failed",
                            evaluation_id = %evaluation.id,
                            error = %pe,
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, evaluation: &mut Evaluation, clock: Instant) -> anyhow::Result<()> {
        let (metrics, k) = validate_task(&evaluation.task)?;

        let pool = CandidatePoolBuilder::new(self.store.clone())
            .build(&evaluation.workspace_id, &evaluation.task)
            .await
            .context("resolving candidates")?;
        if pool.is_empty() {
            evaluation.meta.status = EvaluationStatus::Skipped;
            evaluation.meta.stopped_at = Some(Utc::now());
            evaluation.took = Some(clock.elapsed().as_millis() as u64);
            return Ok(());
        }
        evaluation.strategy_id = pool.strategies.keys().cloned().collect();
        evaluation.scenario_id = pool.scenarios.keys().cloned().collect();

        // The workspace must still exist. Its rating scale is reserved for rating-aware metrics.
        let workspace = self
            .store
            .get(Collection::Workspaces, &evaluation.workspace_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: Collection::Workspaces.as_str().to_string(),
                id: evaluation.workspace_id.clone(),
            })?
            .parse::<Workspace>()?;

        let mut runtime = Runtime::default();
        let strategies = self
            .load_strategies(&evaluation.task, &pool, &mut runtime)
            .await?;
        let scenarios = self.load_scenarios(&pool, &mut runtime).await?;
        let ratings = self
            .load_ratings(&evaluation.workspace_id, &pool, &mut runtime)
            .await?;

        let templates: Vec<RankEvalTemplate> = strategies
            .values()
            .map(|s| RankEvalTemplate {
                id: s.id.clone(),
                template: s.template.clone(),
            })
            .collect();

        let mut lookup: BTreeMap<String, (String, String)> = BTreeMap::new();
        let mut requests = Vec::new();
        for (sid, cid) in pool.pairs() {
            let (Some(_), Some(scenario)) = (strategies.get(sid), scenarios.get(cid)) else {
                continue;
            };
            let req_id = format!("{}~{}", sid, cid);
            requests.push(RankEvalRequest {
                id: req_id.clone(),
                template_id: sid.to_string(),
                params: scenario.values.clone(),
                ratings: ratings.get(cid).cloned().unwrap_or_default(),
            });
            lookup.insert(req_id, (sid.to_string(), cid.to_string()));
        }

        let mut matrix: BTreeMap<String, BTreeMap<String, Cell>> = BTreeMap::new();
        let mut unrated: BTreeMap<(String, String), UnratedTally> = BTreeMap::new();

        for metric in &metrics {
            let spec = metric.spec(k);
            let fut = self
                .evaluator
                .rank_eval(&workspace.index_pattern, &templates, &requests, &spec);
            let resp = timeout(self.policy.scoring_timeout, fut)
                .await
                .map_err(|_| StoreError::Timeout(self.policy.scoring_timeout.as_millis() as u64))?
                .with_context(|| format!("scoring {}", metric.name()))?;

            if !resp.failures.is_empty() {
                return Err(StoreError::ScoringFailures {
                    count: resp.failures.len(),
                    detail: serde_json::to_string(&resp.failures)?,
                }
                .into());
            }

            for (req_id, score) in resp.details {
                let Some((sid, cid)) = lookup.get(&req_id) else {
                    tracing::debug!(event = "scoring.unknown_request", request_id = %req_id);
                    continue;
                };
                let cell = matrix
                    .entry(sid.clone())
                    .or_default()
                    .entry(cid.clone())
                    .or_default();
                cell.metrics.insert(metric.name().to_string(), score.metric_score);

                // Hit lists are identical across metrics; keep and tally the first one only.
                if cell.hits.is_none() {
                    for h in score.hits.iter().filter(|h| h.rating.is_none()) {
                        let t = unrated
                            .entry((h.hit.index.clone(), h.hit.id.clone()))
                            .or_default();
                        t.count += 1;
                        t.strategies.insert(sid.clone());
                        t.scenarios.insert(cid.clone());
                    }
                    cell.hits = Some(score.hits);
                }
            }
        }

        runtime.index_fingerprint = match self
            .evaluator
            .index_fingerprint(&workspace.index_pattern)
            .await
        {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!(
                    event = "runtime.fingerprint_unavailable",
                    index_pattern = %workspace.index_pattern,
                    error = %e,
                );
                None
            }
        };

        evaluation.results = Some(restructure(matrix));
        evaluation.unrated_docs = Some(rank_unrated(unrated));
        evaluation.runtime = Some(runtime);
        evaluation.meta.status = EvaluationStatus::Completed;
        evaluation.meta.stopped_at = Some(Utc::now());
        evaluation.took = Some(clock.elapsed().as_millis() as u64);
        evaluation.error = None;
        Ok(())
    }

    async fn load_strategies(
        &self,
        task: &Task,
        pool: &CandidatePool,
        runtime: &mut Runtime,
    ) -> anyhow::Result<BTreeMap<String, Strategy>> {
        let mut out = BTreeMap::new();
        if let Some(docs) = &task.strategies.docs {
            for s in docs.iter().filter(|s| pool.strategies.contains_key(&s.id)) {
                runtime.strategies.insert(
                    s.id.clone(),
                    RuntimeEntry {
                        version: None,
                        doc: serde_json::to_value(s)?,
                    },
                );
                out.insert(s.id.clone(), s.clone());
            }
            return Ok(out);
        }

        let ids: Vec<String> = pool.strategies.keys().cloned().collect();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let q = Query::new().filter(Filter::terms("_id", chunk.iter().cloned()));
            for d in self.store.search(Collection::Strategies, &q).await? {
                let s: Strategy = d.parse()?;
                runtime.strategies.insert(
                    d.id.clone(),
                    RuntimeEntry {
                        version: Some(d.version),
                        doc: d.source,
                    },
                );
                out.insert(d.id, s);
            }
        }
        Ok(out)
    }

    async fn load_scenarios(
        &self,
        pool: &CandidatePool,
        runtime: &mut Runtime,
    ) -> anyhow::Result<BTreeMap<String, Scenario>> {
        let mut out = BTreeMap::new();
        let ids: Vec<String> = pool.scenarios.keys().cloned().collect();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let q = Query::new().filter(Filter::terms("_id", chunk.iter().cloned()));
            for d in self.store.search(Collection::Scenarios, &q).await? {
                let s: Scenario = d.parse()?;
                runtime.scenarios.insert(
                    d.id.clone(),
                    RuntimeEntry {
                        version: Some(d.version),
                        doc: d.source,
                    },
                );
                out.insert(d.id, s);
            }
        }
        Ok(out)
    }

    /// Judgement ratings grouped by scenario id.
    async fn load_ratings(
        &self,
        workspace_id: &str,
        pool: &CandidatePool,
        runtime: &mut Runtime,
    ) -> anyhow::Result<BTreeMap<String, Vec<DocRating>>> {
        let mut out: BTreeMap<String, Vec<DocRating>> = BTreeMap::new();
        let ids: Vec<String> = pool.scenarios.keys().cloned().collect();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let q = Query::new()
                .filter(Filter::term("workspace_id", workspace_id))
                .filter(Filter::terms("scenario_id", chunk.iter().cloned()));
            for d in self.store.search(Collection::Judgements, &q).await? {
                let j: Judgement = d.parse()?;
                out.entry(j.scenario_id.clone()).or_default().push(DocRating {
                    index: j.index,
                    id: j.doc_id,
                    rating: j.rating,
                });
                runtime.judgements.insert(
                    d.id,
                    RuntimeEntry {
                        version: Some(d.version),
                        doc: d.source,
                    },
                );
            }
        }
        Ok(out)
    }

    /// Writes the evaluation document, retrying transient store failures.
    pub async fn persist(&self, evaluation: &Evaluation) -> anyhow::Result<()> {
        let doc = serde_json::to_value(evaluation)?;
        let mut attempt: u32 = 0;
        loop {
            match self
                .store
                .put(Collection::Evaluations, &evaluation.id, &doc)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.policy.persist_retries => {
                    attempt += 1;
                    tracing::warn!(
                        event = "evaluation.persist_retry",
                        evaluation_id = %evaluation.id,
                        attempt,
                        error = %e,
                    );
                    sleep(self.policy.persist_backoff * attempt).await;
                }
                Err(e) => {
                    return Err(e.context(format!("persisting evaluation {}", evaluation.id)))
                }
            }
        }
    }
}

fn restructure(matrix: BTreeMap<String, BTreeMap<String, Cell>>) -> Vec<StrategyResult> {
    matrix
        .into_iter()
        .map(|(strategy_id, row)| StrategyResult {
            strategy_id,
            searches: row
                .into_iter()
                .map(|(scenario_id, cell)| SearchResult {
                    scenario_id,
                    metrics: cell.metrics,
                    hits: cell.hits.unwrap_or_default(),
                })
                .collect(),
        })
        .collect()
}

/// Count descending, then (index, id) ascending.
fn rank_unrated(tally: BTreeMap<(String, String), UnratedTally>) -> Vec<UnratedDoc> {
    // BTreeMap order is already (index, id); the stable sort keeps it for equal counts.
    let mut docs: Vec<UnratedDoc> = tally
        .into_iter()
        .map(|((index, id), t)| UnratedDoc {
            index,
            id,
            count: t.count,
            strategies: t.strategies.into_iter().collect(),
            scenarios: t.scenarios.into_iter().collect(),
        })
        .collect();
    docs.sort_by(|a, b| b.count.cmp(&a.count));
    docs
}
