mod common;

use async_trait::async_trait;
use common::*;
use relstudio_core::catalog;
use relstudio_core::config::WorkerConfig;
use relstudio_core::engine::{PollOutcome, Worker};
use relstudio_core::storage::store::SqliteStore;
use relstudio_core::storage::{
    Collection, Condition, Document, DocumentStore, FieldUpdate, Query,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};

struct MockWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture() -> (Arc<Mutex<Vec<u8>>>, tracing::subscriber::DefaultGuard) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || MockWriter(writer.clone()))
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

fn output(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
}

#[tokio::test]
async fn test_failed_evaluation_emits_structured_warning() -> anyhow::Result<()> {
    let (buffer, _guard) = capture();

    let store = memory_store();
    seed_workspace(store.as_ref()).await;
    let mut task = ndcg_task();
    task.metrics = vec!["mrr".into()];
    seed_benchmark(store.as_ref(), "bench", task).await;
    let queued = catalog::create_evaluation(store.as_ref(), "bench").await?;

    let worker = Worker::new(
        store.clone(),
        ScriptedEvaluator::returning(&[]),
        WorkerConfig::default(),
    );
    worker.poll_once().await?;

    let out = output(&buffer);
    assert!(out.contains("\"event\":\"evaluation.queued\""));
    assert!(out.contains("\"event\":\"worker.claimed\""));
    assert!(out.contains("\"event\":\"evaluation.failed\""));
    assert!(out.contains(&format!("\"evaluation_id\":\"{}\"", queued.id)));
    assert!(out.contains("unknown metric 'mrr'"));
    assert!(out.contains("\"level\":\"WARN\""));
    Ok(())
}

/// A store on which every conditional update loses to some other worker.
struct Contended(Arc<SqliteStore>);

#[async_trait]
impl DocumentStore for Contended {
    async fn get(&self, collection: Collection, id: &str) -> anyhow::Result<Option<Document>> {
        self.0.get(collection, id).await
    }

    async fn put(&self, collection: Collection, id: &str, source: &Value) -> anyhow::Result<i64> {
        self.0.put(collection, id, source).await
    }

    async fn search(&self, collection: Collection, query: &Query) -> anyhow::Result<Vec<Document>> {
        self.0.search(collection, query).await
    }

    async fn conditional_update(
        &self,
        _collection: Collection,
        _id: &str,
        _condition: &Condition,
        _updates: &[FieldUpdate],
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn delete_by_query(&self, collection: Collection, query: &Query) -> anyhow::Result<u64> {
        self.0.delete_by_query(collection, query).await
    }
}

#[tokio::test]
async fn test_lost_claim_logs_at_debug_only() -> anyhow::Result<()> {
    let (buffer, _guard) = capture();

    let store = memory_store();
    seed_workspace(store.as_ref()).await;
    seed_benchmark(store.as_ref(), "bench", ndcg_task()).await;
    let queued = catalog::create_evaluation(store.as_ref(), "bench").await?;
    buffer.lock().unwrap().clear();

    let worker = Worker::new(
        Arc::new(Contended(store.clone())),
        ScriptedEvaluator::returning(&[]),
        WorkerConfig::default(),
    );
    assert_eq!(worker.poll_once().await?, PollOutcome::Idle);

    let out = output(&buffer);
    assert!(out.contains("\"event\":\"worker.claim_lost\""));
    assert!(out.contains(&queued.id));
    assert!(out.contains("\"level\":\"DEBUG\""));
    assert!(!out.contains("\"level\":\"WARN\""));
    assert!(!out.contains("\"level\":\"ERROR\""));
    Ok(())
}
