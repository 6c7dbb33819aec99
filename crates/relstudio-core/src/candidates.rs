use crate::model::{Judgement, MatchMode, Scenario, Strategy, Task};
use crate::sampling::{self, ScenarioSample};
use crate::storage::{Collection, DocumentStore, Filter, Query};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const DEFAULT_SAMPLE_SIZE: usize = 1000;
pub const MAX_SAMPLE_SIZE: usize = 1000;

/// Scenario ids per judgement lookup.
const JUDGEMENT_LOOKUP_CHUNK: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Sorted; used to group results.
    pub tags: Vec<String>,
    pub params: BTreeSet<String>,
}

/// Resolved, filtered and sampled strategy/scenario sets for one evaluation run.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    pub strategies: BTreeMap<String, Candidate>,
    pub scenarios: BTreeMap<String, Candidate>,
    pub match_mode: MatchMode,
}

impl CandidatePool {
    /// True when there is no runnable work.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty() || self.scenarios.is_empty()
    }

    /// Every (strategy, scenario) pair compatible under the pool's match mode.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::new();
        for (sid, s) in &self.strategies {
            for (cid, c) in &self.scenarios {
                if self.match_mode.matches(&s.params, &c.params) {
                    out.push((sid.as_str(), cid.as_str()));
                }
            }
        }
        out
    }
}

pub struct CandidatePoolBuilder {
    store: Arc<dyn DocumentStore>,
}

impl CandidatePoolBuilder {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn build(&self, workspace_id: &str, task: &Task) -> anyhow::Result<CandidatePool> {
        let strategies = self.resolve_strategies(workspace_id, task).await?;
        let runnable = self.resolve_runnable_scenarios(workspace_id, task).await?;

        let n = effective_sample_size(task.scenarios.sample_size);
        let sampled = sampling::sample_seeded(&runnable, n, task.scenarios.sample_seed);

        let pool = cross_filter(strategies, sampled, task.match_mode);
        tracing::debug!(
            event = "candidates.resolved",
            workspace_id = %workspace_id,
            runnable = runnable.len(),
            strategies = pool.strategies.len(),
            scenarios = pool.scenarios.len(),
            match_mode = ?pool.match_mode,
        );
        Ok(pool)
    }

    async fn resolve_strategies(
        &self,
        workspace_id: &str,
        task: &Task,
    ) -> anyhow::Result<BTreeMap<String, Candidate>> {
        if let Some(docs) = &task.strategies.docs {
            return Ok(docs
                .iter()
                .map(|s| (s.id.clone(), strategy_candidate(s)))
                .collect());
        }

        let query = narrowed_query(
            workspace_id,
            task.strategies.ids.as_deref(),
            task.strategies.tags.as_deref(),
        );
        let docs = self.store.search(Collection::Strategies, &query).await?;

        let mut out = BTreeMap::new();
        for d in docs {
            let s: Strategy = d.parse()?;
            out.insert(d.id, strategy_candidate(&s));
        }
        Ok(out)
    }

    /// Scenarios with at least one positively rated judgement, with their mean rating.
    async fn resolve_runnable_scenarios(
        &self,
        workspace_id: &str,
        task: &Task,
    ) -> anyhow::Result<BTreeMap<String, ScenarioSample>> {
        let query = narrowed_query(
            workspace_id,
            task.scenarios.ids.as_deref(),
            task.scenarios.tags.as_deref(),
        );
        let docs = self.store.search(Collection::Scenarios, &query).await?;

        let mut scenarios: BTreeMap<String, Scenario> = BTreeMap::new();
        for d in docs {
            let s: Scenario = d.parse()?;
            scenarios.insert(d.id, s);
        }
        if scenarios.is_empty() {
            return Ok(BTreeMap::new());
        }

        let ids: Vec<String> = scenarios.keys().cloned().collect();
        let mut ratings: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for chunk in ids.chunks(JUDGEMENT_LOOKUP_CHUNK) {
            let q = Query::new()
                .filter(Filter::term("workspace_id", workspace_id))
                .filter(Filter::terms("scenario_id", chunk.iter().cloned()));
            for d in self.store.search(Collection::Judgements, &q).await? {
                let j: Judgement = d.parse()?;
                ratings.entry(j.scenario_id).or_default().push(j.rating);
            }
        }

        let mut out = BTreeMap::new();
        for (id, s) in scenarios {
            let Some(rs) = ratings.get(&id) else {
                continue;
            };
            if !rs.iter().any(|r| *r > 0) {
                continue;
            }
            let avg_rating = rs.iter().sum::<i64>() as f64 / rs.len() as f64;
            out.insert(
                id,
                ScenarioSample {
                    params: scenario_params(&s),
                    tags: sorted(&s.tags),
                    avg_rating,
                },
            );
        }
        Ok(out)
    }
}

/// Workspace-scoped query over entities that declare params; ids take precedence over tags.
/// Scenarios drawn per evaluation: defaults to, and never exceeds, [`MAX_SAMPLE_SIZE`].
pub fn effective_sample_size(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_SAMPLE_SIZE).min(MAX_SAMPLE_SIZE)
}

fn narrowed_query(workspace_id: &str, ids: Option<&[String]>, tags: Option<&[String]>) -> Query {
    let mut q = Query::new()
        .filter(Filter::term("workspace_id", workspace_id))
        .filter(Filter::exists("params"));
    match (ids, tags) {
        (Some(ids), _) if !ids.is_empty() => {
            q = q.filter(Filter::terms("_id", ids.iter().cloned()));
        }
        (_, Some(tags)) if !tags.is_empty() => {
            q = q.filter(Filter::terms("tags", tags.iter().cloned()));
        }
        _ => {}
    }
    q
}

fn cross_filter(
    strategies: BTreeMap<String, Candidate>,
    scenarios: BTreeMap<String, ScenarioSample>,
    match_mode: MatchMode,
) -> CandidatePool {
    let mut kept_strategies = BTreeSet::new();
    let mut kept_scenarios = BTreeSet::new();
    for (sid, s) in &strategies {
        for (cid, c) in &scenarios {
            if match_mode.matches(&s.params, &c.params) {
                kept_strategies.insert(sid.clone());
                kept_scenarios.insert(cid.clone());
            }
        }
    }

    CandidatePool {
        strategies: strategies
            .into_iter()
            .filter(|(id, _)| kept_strategies.contains(id))
            .collect(),
        scenarios: scenarios
            .into_iter()
            .filter(|(id, _)| kept_scenarios.contains(id))
            .map(|(id, s)| {
                (
                    id,
                    Candidate {
                        tags: s.tags,
                        params: s.params,
                    },
                )
            })
            .collect(),
        match_mode,
    }
}

fn strategy_candidate(s: &Strategy) -> Candidate {
    let params: BTreeSet<String> = if s.params.is_empty() {
        Strategy::params_from_template(&s.template).into_iter().collect()
    } else {
        s.params.iter().cloned().collect()
    };
    Candidate {
        tags: sorted(&s.tags),
        params,
    }
}

fn scenario_params(s: &Scenario) -> BTreeSet<String> {
    if s.params.is_empty() {
        s.values.keys().cloned().collect()
    } else {
        s.params.iter().cloned().collect()
    }
}

fn sorted(tags: &[String]) -> Vec<String> {
    let mut t = tags.to_vec();
    t.sort();
    t.dedup();
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(params: &[&str]) -> Candidate {
        Candidate {
            tags: vec![],
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn sample(params: &[&str]) -> ScenarioSample {
        ScenarioSample {
            params: params.iter().map(|p| p.to_string()).collect(),
            tags: vec![],
            avg_rating: 1.0,
        }
    }

    #[test]
    fn test_cross_filter_subset_keeps_independent_matches() {
        let mut strategies = BTreeMap::new();
        strategies.insert("s-text".to_string(), cand(&["text"]));
        strategies.insert("s-brand".to_string(), cand(&["brand"]));
        let mut scenarios = BTreeMap::new();
        scenarios.insert("c-text".to_string(), sample(&["text"]));
        scenarios.insert("c-both".to_string(), sample(&["text", "color"]));
        scenarios.insert("c-other".to_string(), sample(&["color"]));

        let pool = cross_filter(strategies, scenarios, MatchMode::Subset);
        assert_eq!(pool.strategies.keys().collect::<Vec<_>>(), vec!["s-text"]);
        assert_eq!(
            pool.scenarios.keys().collect::<Vec<_>>(),
            vec!["c-both", "c-text"]
        );
        assert_eq!(pool.pairs().len(), 2);
    }

    #[test]
    fn test_cross_filter_exact() {
        let mut strategies = BTreeMap::new();
        strategies.insert("s".to_string(), cand(&["text"]));
        let mut scenarios = BTreeMap::new();
        scenarios.insert("c-text".to_string(), sample(&["text"]));
        scenarios.insert("c-both".to_string(), sample(&["text", "color"]));

        let pool = cross_filter(strategies, scenarios, MatchMode::Exact);
        assert_eq!(pool.scenarios.keys().collect::<Vec<_>>(), vec!["c-text"]);
        for (s, c) in pool.pairs() {
            assert_eq!(pool.strategies[s].params, pool.scenarios[c].params);
        }
    }

    #[test]
    fn test_empty_side_degenerates_to_empty_pool() {
        let mut strategies = BTreeMap::new();
        strategies.insert("s".to_string(), cand(&["text"]));
        let pool = cross_filter(strategies, BTreeMap::new(), MatchMode::Subset);
        assert!(pool.is_empty());
        assert!(pool.strategies.is_empty());
    }

    #[test]
    fn test_effective_sample_size_defaults_and_caps() {
        assert_eq!(effective_sample_size(None), 1000);
        assert_eq!(effective_sample_size(Some(5000)), 1000);
        assert_eq!(effective_sample_size(Some(1000)), 1000);
        assert_eq!(effective_sample_size(Some(5)), 5);
    }

    #[test]
    fn test_ids_take_precedence_over_tags() {
        let ids = vec!["a".to_string()];
        let tags = vec!["head".to_string()];
        let q = narrowed_query("ws", Some(&ids), Some(&tags));
        assert!(q.filters.contains(&Filter::terms("_id", ids.clone())));
        assert!(!q.filters.iter().any(|f| matches!(f, Filter::Terms { field, .. } if field == "tags")));

        let q = narrowed_query("ws", Some(&[]), Some(&tags));
        assert!(q.filters.contains(&Filter::terms("tags", tags.clone())));
    }
}
