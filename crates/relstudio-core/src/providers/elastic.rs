use super::rank_eval::{
    Metric, MetricSpec, RankEvalRequest, RankEvalResponse, RankEvalTemplate, RankEvaluator,
    RequestScore,
};
use crate::errors::StoreError;
use crate::fingerprint::{index_fingerprint, IndexState};
use crate::model::{Hit, RatedHit};
use crate::storage::{Collection, Condition, Document, DocumentStore, FieldUpdate, Filter, Query};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Elasticsearch search windows are capped at this many hits.
const MAX_RESULT_WINDOW: usize = 10_000;
const PIT_KEEP_ALIVE: &str = "1m";

/// REST client for an Elasticsearch-compatible cluster. Serves both as the document store
/// (one index per collection, named `<prefix><collection>`) and as the rank evaluator.
pub struct ElasticClient {
    pub base_url: String,
    pub api_key: Option<String>,
    pub index_prefix: String,
    pub client: reqwest::Client,
}

impl ElasticClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        index_prefix: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            index_prefix: index_prefix.to_string(),
            client,
        })
    }

    pub fn index_name(&self, collection: Collection) -> String {
        format!("{}{}", self.index_prefix, collection.as_str())
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> anyhow::Result<(StatusCode, Value)> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut req = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("ApiKey {}", key));
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, value))
    }

    /// Walks every match under a point-in-time with `search_after`, past the result window.
    async fn search_paged(
        &self,
        index: &str,
        query: &Query,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<Document>> {
        let path = format!("{}/_pit?keep_alive={}", index, PIT_KEEP_ALIVE);
        let (status, resp) = self.call(Method::POST, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = Self::check(status, resp)?;
        let pit_id = resp
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("point-in-time response for {} carried no id", index))?
            .to_string();

        let result = self.page_through(pit_id.clone(), query, limit).await;

        let close = json!({ "id": pit_id });
        if let Err(e) = self.call(Method::DELETE, "_pit", Some(&close)).await {
            tracing::debug!(event = "store.pit_close_failed", index = %index, error = %e);
        }
        result
    }

    async fn page_through(
        &self,
        mut pit_id: String,
        query: &Query,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<Document>> {
        let mut out = Vec::new();
        let mut after: Option<Value> = None;
        loop {
            let want = match limit {
                Some(l) => l.saturating_sub(out.len()).min(MAX_RESULT_WINDOW),
                None => MAX_RESULT_WINDOW,
            };
            if want == 0 {
                break;
            }
            let body = paged_search_body(query, want, &pit_id, after.as_ref());
            let (status, resp) = self.call(Method::POST, "_search", Some(&body)).await?;
            let resp = Self::check(status, resp)?;
            if let Some(id) = resp.get("pit_id").and_then(|v| v.as_str()) {
                pit_id = id.to_string();
            }

            let hits = hits_of(&resp);
            after = hits.last().and_then(|h| h.get("sort")).cloned();
            out.extend(hits.iter().filter_map(hit_to_document));
            if hits.len() < want || after.is_none() {
                break;
            }
        }
        Ok(out)
    }

    fn check(status: StatusCode, body: Value) -> anyhow::Result<Value> {
        if status.is_success() {
            Ok(body)
        } else {
            Err(StoreError::Http {
                status: status.as_u16(),
                body: body.to_string(),
            }
            .into())
        }
    }
}

fn filter_to_dsl(f: &Filter) -> Value {
    match f {
        Filter::Term { field, value } => json!({ "term": { field: value } }),
        Filter::Terms { field, values } => json!({ "terms": { field: values } }),
        Filter::Exists { field } => json!({ "exists": { "field": field } }),
        Filter::Range { field, gt, lt } => {
            let mut bounds = serde_json::Map::new();
            if let Some(v) = gt {
                bounds.insert("gt".into(), v.clone());
            }
            if let Some(v) = lt {
                bounds.insert("lt".into(), v.clone());
            }
            json!({ "range": { field: bounds } })
        }
    }
}

fn query_to_dsl(query: &Query) -> Value {
    let filters: Vec<Value> = query.filters.iter().map(filter_to_dsl).collect();
    json!({ "bool": { "filter": filters } })
}

fn search_body(query: &Query, size: usize) -> Value {
    let mut body = json!({
        "query": query_to_dsl(query),
        "size": size,
        "version": true,
    });
    if let Some(sort) = &query.sort {
        let order = if sort.descending { "desc" } else { "asc" };
        body["sort"] = json!([{ sort.field.as_str(): { "order": order } }]);
    }
    body
}

/// A `search_after` page. `_shard_doc` breaks ties so pages never overlap.
fn paged_search_body(query: &Query, size: usize, pit_id: &str, after: Option<&Value>) -> Value {
    let mut body = search_body(query, size);
    body["pit"] = json!({ "id": pit_id, "keep_alive": PIT_KEEP_ALIVE });
    body["track_total_hits"] = json!(false);
    let mut sort = body
        .get("sort")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();
    sort.push(json!({ "_shard_doc": "asc" }));
    body["sort"] = Value::Array(sort);
    if let Some(after) = after {
        body["search_after"] = after.clone();
    }
    body
}

fn hits_of(resp: &Value) -> Vec<Value> {
    resp.pointer("/hits/hits")
        .and_then(|h| h.as_array())
        .cloned()
        .unwrap_or_default()
}

fn hit_to_document(h: &Value) -> Option<Document> {
    Some(Document {
        id: h.get("_id")?.as_str()?.to_string(),
        version: h.get("_version").and_then(|v| v.as_i64()).unwrap_or(0),
        source: h.get("_source").cloned().unwrap_or(Value::Null),
    })
}

fn metric_to_dsl(spec: &MetricSpec) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("k".into(), json!(spec.k));
    if let Some(n) = spec.normalize {
        body.insert("normalize".into(), json!(n));
    }
    if let Some(i) = spec.ignore_unlabeled {
        body.insert("ignore_unlabeled".into(), json!(i));
    }
    let name = match spec.metric {
        Metric::Ndcg => "dcg",
        Metric::Precision => "precision",
        Metric::Recall => "recall",
    };
    json!({ name: body })
}

/// Painless source that applies `updates` only when `condition` holds, else a no-op.
fn conditional_script(condition: &Condition, updates: &[FieldUpdate]) -> Value {
    let mut params = serde_json::Map::new();
    params.insert("expected".into(), condition.equals.clone());

    let mut assignments = Vec::with_capacity(updates.len());
    for (i, u) in updates.iter().enumerate() {
        let key = format!("u{}", i);
        assignments.push(format!("ctx._source.{} = params.{};", u.field, key));
        params.insert(key, u.value.clone());
    }

    let source = format!(
        "if (ctx._source.{} == params.expected) {{ {} }} else {{ ctx.op = 'noop'; }}",
        condition.field,
        assignments.join(" ")
    );
    json!({ "source": source, "lang": "painless", "params": params })
}

fn parse_rated_hit(v: &Value) -> Option<RatedHit> {
    let hit = v.get("hit")?;
    Some(RatedHit {
        hit: Hit {
            index: hit.get("_index")?.as_str()?.to_string(),
            id: hit.get("_id")?.as_str()?.to_string(),
            score: hit.get("_score").and_then(|s| s.as_f64()),
        },
        rating: v.get("rating").and_then(|r| r.as_i64()),
    })
}

#[async_trait]
impl DocumentStore for ElasticClient {
    async fn get(&self, collection: Collection, id: &str) -> anyhow::Result<Option<Document>> {
        let path = format!("{}/_doc/{}", self.index_name(collection), id);
        let (status, body) = self.call(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::check(status, body)?;
        Ok(Some(Document {
            id: id.to_string(),
            version: body.get("_version").and_then(|v| v.as_i64()).unwrap_or(0),
            source: body.get("_source").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn put(&self, collection: Collection, id: &str, source: &Value) -> anyhow::Result<i64> {
        let path = format!("{}/_doc/{}?refresh=wait_for", self.index_name(collection), id);
        let (status, body) = self.call(Method::PUT, &path, Some(source)).await?;
        let body = Self::check(status, body)?;
        Ok(body.get("_version").and_then(|v| v.as_i64()).unwrap_or(0))
    }

    async fn search(&self, collection: Collection, query: &Query) -> anyhow::Result<Vec<Document>> {
        let index = self.index_name(collection);
        match query.size {
            Some(size) if size <= MAX_RESULT_WINDOW => {
                let path = format!("{}/_search", index);
                let body = search_body(query, size);
                let (status, resp) = self.call(Method::POST, &path, Some(&body)).await?;
                if status == StatusCode::NOT_FOUND {
                    return Ok(Vec::new());
                }
                let resp = Self::check(status, resp)?;
                Ok(hits_of(&resp).iter().filter_map(hit_to_document).collect())
            }
            limit => self.search_paged(&index, query, limit).await,
        }
    }

    async fn conditional_update(
        &self,
        collection: Collection,
        id: &str,
        condition: &Condition,
        updates: &[FieldUpdate],
    ) -> anyhow::Result<bool> {
        let path = format!("{}/_update/{}?refresh=wait_for", self.index_name(collection), id);
        let body = json!({ "script": conditional_script(condition, updates) });
        let (status, resp) = self.call(Method::POST, &path, Some(&body)).await?;

        // 404: gone. 409: a concurrent writer won the race.
        if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
            return Ok(false);
        }
        let resp = Self::check(status, resp)?;
        Ok(resp.get("result").and_then(|r| r.as_str()) == Some("updated"))
    }

    async fn delete_by_query(&self, collection: Collection, query: &Query) -> anyhow::Result<u64> {
        let path = format!(
            "{}/_delete_by_query?refresh=true&conflicts=proceed",
            self.index_name(collection)
        );
        let body = json!({ "query": query_to_dsl(query) });
        let (status, resp) = self.call(Method::POST, &path, Some(&body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let resp = Self::check(status, resp)?;
        Ok(resp.get("deleted").and_then(|d| d.as_u64()).unwrap_or(0))
    }
}

#[async_trait]
impl RankEvaluator for ElasticClient {
    async fn rank_eval(
        &self,
        index_pattern: &str,
        templates: &[RankEvalTemplate],
        requests: &[RankEvalRequest],
        metric: &MetricSpec,
    ) -> anyhow::Result<RankEvalResponse> {
        let templates: Vec<Value> = templates
            .iter()
            .map(|t| json!({ "id": t.id, "template": { "source": t.template } }))
            .collect();
        let requests: Vec<Value> = requests
            .iter()
            .map(|r| {
                let ratings: Vec<Value> = r
                    .ratings
                    .iter()
                    .map(|d| json!({ "_index": d.index, "_id": d.id, "rating": d.rating }))
                    .collect();
                json!({
                    "id": r.id,
                    "template_id": r.template_id,
                    "params": r.params,
                    "ratings": ratings,
                })
            })
            .collect();
        let body = json!({
            "templates": templates,
            "requests": requests,
            "metric": metric_to_dsl(metric),
        });

        let path = format!("{}/_rank_eval", index_pattern);
        let (status, resp) = self.call(Method::POST, &path, Some(&body)).await?;
        let resp = Self::check(status, resp)?;

        let mut details = BTreeMap::new();
        if let Some(obj) = resp.get("details").and_then(|d| d.as_object()) {
            for (req_id, d) in obj {
                let hits = d
                    .get("hits")
                    .and_then(|h| h.as_array())
                    .map(|arr| arr.iter().filter_map(parse_rated_hit).collect())
                    .unwrap_or_default();
                details.insert(
                    req_id.clone(),
                    RequestScore {
                        metric_score: d.get("metric_score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                        hits,
                    },
                );
            }
        }
        let failures = resp
            .get("failures")
            .and_then(|f| f.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(RankEvalResponse {
            metric_score: resp.get("metric_score").and_then(|s| s.as_f64()).unwrap_or(0.0),
            details,
            failures,
        })
    }

    async fn index_fingerprint(&self, index_pattern: &str) -> anyhow::Result<Option<String>> {
        let path = format!("{}/_stats/docs", index_pattern);
        let (status, resp) = self.call(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(status, resp)?;

        let Some(indices) = resp.get("indices").and_then(|i| i.as_object()) else {
            return Ok(None);
        };
        let states: Vec<IndexState> = indices
            .iter()
            .map(|(name, v)| IndexState {
                name: name.clone(),
                uuid: v.get("uuid").and_then(|u| u.as_str()).unwrap_or("").to_string(),
                doc_count: v
                    .pointer("/primaries/docs/count")
                    .and_then(|c| c.as_u64())
                    .unwrap_or(0),
            })
            .collect();
        if states.is_empty() {
            return Ok(None);
        }
        Ok(Some(index_fingerprint(&states)))
    }

    fn provider_name(&self) -> &'static str {
        "elasticsearch"
    }
}
