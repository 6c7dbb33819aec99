#![allow(dead_code)]

use async_trait::async_trait;
use relstudio_core::catalog;
use relstudio_core::model::{
    Author, Benchmark, Hit, RatedHit, RatingScale, Scenario, Strategy, Task, Workspace,
};
use relstudio_core::providers::rank_eval::{
    MetricSpec, RankEvalRequest, RankEvalResponse, RankEvalTemplate, RankEvaluator, RequestScore,
};
use relstudio_core::storage::store::SqliteStore;
use relstudio_core::storage::DocumentStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const WS: &str = "ws-products";
pub const INDEX: &str = "products";

pub fn memory_store() -> Arc<SqliteStore> {
    let store = SqliteStore::memory().expect("memory store");
    store.init_schema().expect("schema");
    Arc::new(store)
}

/// Returns the same ranked documents for every request and rates them from the request's
/// own rating list, the way the real scoring operation does.
pub struct ScriptedEvaluator {
    pub ranked: Vec<String>,
    pub fail_with: Option<String>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<(MetricSpec, Vec<String>)>>,
}

impl ScriptedEvaluator {
    pub fn returning(ranked: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            ranked: ranked.iter().map(|s| s.to_string()).collect(),
            fail_with: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(msg: &str) -> Arc<Self> {
        Arc::new(Self {
            ranked: Vec::new(),
            fail_with: Some(msg.to_string()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RankEvaluator for ScriptedEvaluator {
    async fn rank_eval(
        &self,
        _index_pattern: &str,
        _templates: &[RankEvalTemplate],
        requests: &[RankEvalRequest],
        metric: &MetricSpec,
    ) -> anyhow::Result<RankEvalResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((metric.clone(), requests.iter().map(|r| r.id.clone()).collect()));
        if let Some(msg) = &self.fail_with {
            anyhow::bail!("{}", msg);
        }

        let mut resp = RankEvalResponse::default();
        for req in requests {
            let hits: Vec<RatedHit> = self
                .ranked
                .iter()
                .take(metric.k as usize)
                .enumerate()
                .map(|(i, id)| RatedHit {
                    hit: Hit {
                        index: INDEX.to_string(),
                        id: id.clone(),
                        score: Some(10.0 - i as f64),
                    },
                    rating: req
                        .ratings
                        .iter()
                        .find(|r| r.index == INDEX && &r.id == id)
                        .map(|r| r.rating),
                })
                .collect();
            let relevant = hits.iter().filter(|h| h.rating.unwrap_or(0) > 0).count();
            let metric_score = if hits.is_empty() {
                0.0
            } else {
                relevant as f64 / hits.len() as f64
            };
            resp.details.insert(
                req.id.clone(),
                RequestScore { metric_score, hits },
            );
        }
        Ok(resp)
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

pub async fn seed_workspace(store: &dyn DocumentStore) {
    catalog::create_workspace(
        store,
        &Workspace {
            id: WS.to_string(),
            name: "Products".to_string(),
            index_pattern: INDEX.to_string(),
            params: vec!["text".to_string()],
            rating_scale: RatingScale { min: 0, max: 4 },
            tags: vec![],
        },
    )
    .await
    .expect("workspace");
}

pub async fn seed_scenario(store: &dyn DocumentStore, text: &str, tags: &[&str]) -> Scenario {
    let mut values = BTreeMap::new();
    values.insert("text".to_string(), text.to_string());
    catalog::create_scenario(
        store,
        WS,
        text,
        values,
        tags.iter().map(|t| t.to_string()).collect(),
    )
    .await
    .expect("scenario")
}

pub async fn seed_strategy(store: &dyn DocumentStore, id: &str, field: &str) -> Strategy {
    catalog::create_strategy(
        store,
        Strategy {
            id: id.to_string(),
            workspace_id: WS.to_string(),
            name: id.to_string(),
            params: vec![],
            tags: vec![],
            template: serde_json::json!({
                "query": { "match": { field: "{{ text }}" } }
            }),
        },
    )
    .await
    .expect("strategy")
}

pub async fn rate(store: &dyn DocumentStore, scenario_id: &str, doc: &str, rating: i64) {
    catalog::set_judgement(store, WS, scenario_id, INDEX, doc, rating, Author::Human)
        .await
        .expect("judgement");
}

pub async fn seed_benchmark(store: &dyn DocumentStore, id: &str, task: Task) -> Benchmark {
    let benchmark = Benchmark {
        id: id.to_string(),
        workspace_id: WS.to_string(),
        name: id.to_string(),
        tags: vec![],
        task,
    };
    catalog::create_benchmark(store, &benchmark)
        .await
        .expect("benchmark");
    benchmark
}

pub fn ndcg_task() -> Task {
    Task {
        metrics: vec!["ndcg".to_string()],
        k: 10,
        ..Default::default()
    }
}
