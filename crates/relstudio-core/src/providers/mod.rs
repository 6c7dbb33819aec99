pub mod elastic;
pub mod rank_eval;

pub use rank_eval::{Metric, MetricSpec, RankEvaluator};
