//! Stratified scenario sampling.
//!
//! Scenarios are bucketed by `(tag, floor(avg_rating))` and drawn round-robin over the
//! buckets in a shuffled order, so a bounded run still covers every tag/rating stratum
//! before any stratum contributes a second scenario.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Bucket for scenarios that carry no tags.
pub const NO_TAG: &str = "_no_tag";

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSample {
    pub params: BTreeSet<String>,
    pub tags: Vec<String>,
    pub avg_rating: f64,
}

type BucketKey = (String, i64);

/// Draws at most `n` scenarios. Populations of size `<= n` are returned unchanged.
pub fn sample<R: Rng + ?Sized>(
    population: &BTreeMap<String, ScenarioSample>,
    n: usize,
    rng: &mut R,
) -> BTreeMap<String, ScenarioSample> {
    if population.len() <= n {
        return population.clone();
    }

    let mut buckets: BTreeMap<BucketKey, VecDeque<&str>> = BTreeMap::new();
    for (id, s) in population {
        // Truncation, not rounding.
        let stratum = s.avg_rating.trunc() as i64;
        let tags: BTreeSet<&str> = if s.tags.is_empty() {
            [NO_TAG].into()
        } else {
            s.tags.iter().map(String::as_str).collect()
        };
        for tag in tags {
            buckets
                .entry((tag.to_string(), stratum))
                .or_default()
                .push_back(id.as_str());
        }
    }

    let mut selected: BTreeSet<&str> = BTreeSet::new();
    while selected.len() < n {
        buckets.retain(|_, b| !b.is_empty());
        if buckets.is_empty() {
            break;
        }

        let mut keys: Vec<BucketKey> = buckets.keys().cloned().collect();
        keys.shuffle(rng);

        for key in keys {
            if selected.len() >= n {
                break;
            }
            let Some(bucket) = buckets.get_mut(&key) else {
                continue;
            };
            // A scenario drawn through another of its tags is no longer available here.
            while let Some(id) = bucket.pop_front() {
                if selected.insert(id) {
                    break;
                }
            }
        }
    }

    selected
        .into_iter()
        .filter_map(|id| population.get(id).map(|s| (id.to_string(), s.clone())))
        .collect()
}

/// Samples with an explicit seed, or with a seed drawn once from entropy for this call.
pub fn sample_seeded(
    population: &BTreeMap<String, ScenarioSample>,
    n: usize,
    seed: Option<u64>,
) -> BTreeMap<String, ScenarioSample> {
    let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
    let mut rng = StdRng::seed_from_u64(seed);
    sample(population, n, &mut rng)
}
