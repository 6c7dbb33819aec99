use crate::errors::TaskError;
use crate::model::RatedHit;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Ndcg,
    Precision,
    Recall,
}

impl Metric {
    pub fn parse(s: &str) -> Result<Self, TaskError> {
        match s {
            "ndcg" => Ok(Metric::Ndcg),
            "precision" => Ok(Metric::Precision),
            "recall" => Ok(Metric::Recall),
            other => Err(TaskError::UnknownMetric(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Ndcg => "ndcg",
            Metric::Precision => "precision",
            Metric::Recall => "recall",
        }
    }

    /// Native scoring configuration for this metric at cutoff `k`.
    pub fn spec(&self, k: u32) -> MetricSpec {
        match self {
            Metric::Ndcg => MetricSpec {
                metric: *self,
                k,
                normalize: Some(true),
                ignore_unlabeled: None,
            },
            Metric::Precision => MetricSpec {
                metric: *self,
                k,
                normalize: None,
                ignore_unlabeled: Some(false),
            },
            Metric::Recall => MetricSpec {
                metric: *self,
                k,
                normalize: None,
                ignore_unlabeled: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub metric: Metric,
    pub k: u32,
    pub normalize: Option<bool>,
    pub ignore_unlabeled: Option<bool>,
}

/// One strategy's query definition, addressed by `id` from requests.
#[derive(Debug, Clone, Serialize)]
pub struct RankEvalTemplate {
    pub id: String,
    pub template: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocRating {
    pub index: String,
    pub id: String,
    pub rating: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankEvalRequest {
    pub id: String,
    pub template_id: String,
    pub params: BTreeMap<String, String>,
    pub ratings: Vec<DocRating>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestScore {
    pub metric_score: f64,
    pub hits: Vec<RatedHit>,
}

#[derive(Debug, Clone, Default)]
pub struct RankEvalResponse {
    pub metric_score: f64,
    pub details: BTreeMap<String, RequestScore>,
    /// Per-request failures keyed by request id.
    pub failures: BTreeMap<String, serde_json::Value>,
}

/// The delegated relevance-scoring operation. Implementations compute the metric;
/// callers only assemble requests and fold the per-request results.
#[async_trait]
pub trait RankEvaluator: Send + Sync {
    async fn rank_eval(
        &self,
        index_pattern: &str,
        templates: &[RankEvalTemplate],
        requests: &[RankEvalRequest],
        metric: &MetricSpec,
    ) -> anyhow::Result<RankEvalResponse>;

    async fn index_fingerprint(&self, _index_pattern: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn provider_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(Metric::parse("ndcg").unwrap(), Metric::Ndcg);
        assert_eq!(
            Metric::parse("mrr").unwrap_err(),
            TaskError::UnknownMetric("mrr".into())
        );
    }

    #[test]
    fn test_metric_specific_flags() {
        assert_eq!(Metric::Ndcg.spec(10).normalize, Some(true));
        assert_eq!(Metric::Precision.spec(5).ignore_unlabeled, Some(false));
        let recall = Metric::Recall.spec(3);
        assert_eq!((recall.k, recall.normalize, recall.ignore_unlabeled), (3, None, None));
    }
}
