//! Evaluation scheduler: claims pending evaluations from the shared store and runs them,
//! and periodically reaps `running` evaluations whose executor has gone away.
//!
//! Any number of workers may poll the same store. Claims are lease-free: the only
//! coordination is the store's conditional update on `meta.status`.

use crate::config::WorkerConfig;
use crate::engine::runner::{RunPolicy, Runner};
use crate::model::{ErrorKind, Evaluation, EvaluationError, EvaluationStatus};
use crate::providers::rank_eval::RankEvaluator;
use crate::storage::{Collection, Condition, DocumentStore, FieldUpdate, Filter, Query};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    /// Claimed and ran to a terminal state.
    Ran { evaluation_id: String, status: EvaluationStatus },
    /// Claimed but the run returned an error, or the record did not decode. Either way the
    /// failed record has been persisted.
    Failed { evaluation_id: String },
}

enum Claim {
    Ready(Evaluation),
    Rejected { evaluation_id: String },
}

pub struct Worker {
    store: Arc<dyn DocumentStore>,
    runner: Runner,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        evaluator: Arc<dyn RankEvaluator>,
        config: WorkerConfig,
    ) -> Self {
        let runner = Runner::new(store.clone(), evaluator).with_policy(RunPolicy {
            persist_retries: config.persist_retries,
            scoring_timeout: config.store_timeout(),
            ..RunPolicy::default()
        });
        Self {
            store,
            runner,
            config,
        }
    }

    /// Flips one evaluation from `pending` to `running`. `false` means another worker got it
    /// first, it is no longer pending, or the store did not answer in time.
    /// A timed-out write may still land later; the janitor reaps such evaluations.
    pub async fn try_claim(&self, evaluation_id: &str) -> anyhow::Result<bool> {
        let condition = Condition {
            field: "meta.status".into(),
            equals: EvaluationStatus::Pending.as_str().into(),
        };
        let updates = [
            FieldUpdate::new("meta.status", EvaluationStatus::Running.as_str()),
            FieldUpdate::new("meta.started_at", Utc::now().timestamp_millis()),
        ];
        let fut = self.store.conditional_update(
            Collection::Evaluations,
            evaluation_id,
            &condition,
            &updates,
        );
        match timeout(self.config.store_timeout(), fut).await {
            Ok(applied) => applied,
            Err(_) => {
                tracing::warn!(
                    event = "worker.claim_timeout",
                    evaluation_id = %evaluation_id,
                    timeout_ms = self.config.store_timeout_ms,
                );
                Ok(false)
            }
        }
    }

    /// Reads the oldest pending evaluation and tries to claim it once.
    ///
    /// A claimed record that does not decode is marked `failed` and yields `None`.
    pub async fn claim_next(&self) -> anyhow::Result<Option<Evaluation>> {
        Ok(match self.claim_oldest().await? {
            Some(Claim::Ready(evaluation)) => Some(evaluation),
            Some(Claim::Rejected { .. }) | None => None,
        })
    }

    async fn claim_oldest(&self) -> anyhow::Result<Option<Claim>> {
        let q = Query::new()
            .filter(Filter::term("meta.status", EvaluationStatus::Pending.as_str()))
            .sort_asc("meta.created_at")
            .size(1);
        let hits = match timeout(
            self.config.store_timeout(),
            self.store.search(Collection::Evaluations, &q),
        )
        .await
        {
            Ok(r) => r?,
            Err(_) => {
                tracing::warn!(event = "worker.poll_timeout");
                return Ok(None);
            }
        };
        let Some(oldest) = hits.into_iter().next() else {
            return Ok(None);
        };

        if !self.try_claim(&oldest.id).await? {
            tracing::debug!(event = "worker.claim_lost", evaluation_id = %oldest.id);
            return Ok(None);
        }

        // Re-read so the runner sees the stamped status and start time.
        let claimed = self
            .store
            .get(Collection::Evaluations, &oldest.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("claimed evaluation {} disappeared", oldest.id))?;
        tracing::info!(event = "worker.claimed", evaluation_id = %claimed.id);
        match claimed.parse::<Evaluation>() {
            Ok(evaluation) => Ok(Some(Claim::Ready(evaluation))),
            Err(e) => {
                self.reject(&claimed.id, &e).await?;
                Ok(Some(Claim::Rejected {
                    evaluation_id: claimed.id,
                }))
            }
        }
    }

    /// Terminal `failed` record for a claimed evaluation the runner cannot decode.
    /// Written field by field, since the document as a whole does not deserialize.
    async fn reject(&self, evaluation_id: &str, err: &anyhow::Error) -> anyhow::Result<()> {
        let message = format!("{:#}", err);
        let error = EvaluationError {
            kind: ErrorKind::Validation,
            message: message.clone(),
        };
        let condition = Condition {
            field: "meta.status".into(),
            equals: EvaluationStatus::Running.as_str().into(),
        };
        let updates = [
            FieldUpdate::new("meta.status", EvaluationStatus::Failed.as_str()),
            FieldUpdate::new("meta.stopped_at", Utc::now().timestamp_millis()),
            FieldUpdate::new("error", serde_json::to_value(&error)?),
        ];
        self.store
            .conditional_update(Collection::Evaluations, evaluation_id, &condition, &updates)
            .await?;
        tracing::warn!(
            event = "evaluation.failed",
            evaluation_id = %evaluation_id,
            error = %message,
        );
        Ok(())
    }

    /// One poll cycle: claim at most one evaluation and run it to completion.
    pub async fn poll_once(&self) -> anyhow::Result<PollOutcome> {
        let evaluation = match self.claim_oldest().await? {
            None => return Ok(PollOutcome::Idle),
            Some(Claim::Rejected { evaluation_id }) => {
                return Ok(PollOutcome::Failed { evaluation_id })
            }
            Some(Claim::Ready(evaluation)) => evaluation,
        };
        let evaluation_id = evaluation.id.clone();
        match self.runner.run(evaluation, true).await {
            Ok(done) => Ok(PollOutcome::Ran {
                evaluation_id,
                status: done.meta.status,
            }),
            Err(_) => Ok(PollOutcome::Failed { evaluation_id }),
        }
    }

    /// Deletes `running` evaluations started before `now - stale_after`.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let cutoff = now.timestamp_millis() - self.config.stale_after_ms as i64;
        let q = Query::new()
            .filter(Filter::term("meta.status", EvaluationStatus::Running.as_str()))
            .filter(Filter::lt("meta.started_at", cutoff));
        let deleted = self
            .store
            .delete_by_query(Collection::Evaluations, &q)
            .await?;
        if deleted > 0 {
            tracing::info!(event = "janitor.reaped", deleted, cutoff_ms = cutoff);
        }
        Ok(deleted)
    }

    /// Polls until `shutdown` flips to `true`. A running evaluation is always finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let jitter = if self.config.startup_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.startup_jitter_ms)
        } else {
            0
        };
        tracing::info!(
            event = "worker.started",
            poll_interval_ms = self.config.poll_interval_ms,
            janitor_interval_ms = self.config.janitor_interval_ms,
            jitter_ms = jitter,
        );
        tokio::select! {
            _ = sleep(Duration::from_millis(jitter)) => {}
            _ = shutdown.changed() => {}
        }

        let mut last_janitor: Option<Instant> = None;
        while !*shutdown.borrow() {
            let due = last_janitor.map_or(true, |t| t.elapsed() >= self.config.janitor_interval());
            if due {
                if let Err(e) = self.reap_stale(Utc::now()).await {
                    tracing::warn!(event = "janitor.error", error = %e);
                }
                last_janitor = Some(Instant::now());
            }

            let claimed = match self.poll_once().await {
                Ok(PollOutcome::Idle) => false,
                Ok(PollOutcome::Ran { .. }) | Ok(PollOutcome::Failed { .. }) => true,
                Err(e) => {
                    tracing::warn!(event = "worker.poll_error", error = %format!("{:#}", e));
                    false
                }
            };

            if !claimed {
                tokio::select! {
                    _ = sleep(self.config.poll_interval()) => {}
                    changed = shutdown.changed() => {
                        // Sender dropped.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!(event = "worker.stopped");
        Ok(())
    }
}
