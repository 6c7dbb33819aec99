use anyhow::Result;
use clap::Parser;
use relstudio_core::config::WorkerConfig;
use relstudio_core::engine::Worker;
use relstudio_core::providers::elastic::ElasticClient;
use relstudio_core::providers::RankEvaluator;
use relstudio_core::storage::store::SqliteStore;
use relstudio_core::storage::DocumentStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Elasticsearch base URL holding the studio indices and serving `_rank_eval`.
    #[arg(long, env = "ELASTICSEARCH_URL", default_value = "http://localhost:9200")]
    elasticsearch_url: String,

    #[arg(long, env = "ELASTICSEARCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "RELSTUDIO_INDEX_PREFIX", default_value = "esrs-")]
    index_prefix: String,

    /// Keep studio documents in a local SQLite file instead; scoring still goes to Elasticsearch.
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Worker settings (YAML). Environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reject unknown keys in --config.
    #[arg(long)]
    strict: bool,
}

use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => WorkerConfig::load(path, args.strict)?,
        None => WorkerConfig::default(),
    };
    cfg.apply_env();
    cfg.validate()?;

    init_logging(&cfg.log_level);

    tracing::info!(
        event = "worker_start",
        elasticsearch_url = %args.elasticsearch_url,
        sqlite = ?args.sqlite,
        config = ?cfg
    );

    let elastic = Arc::new(ElasticClient::new(
        &args.elasticsearch_url,
        args.api_key.clone(),
        &args.index_prefix,
        cfg.store_timeout(),
    )?);
    let store: Arc<dyn DocumentStore> = match &args.sqlite {
        Some(path) => {
            let s = SqliteStore::open(path)?;
            s.init_schema()?;
            Arc::new(s)
        }
        None => elastic.clone(),
    };
    let evaluator: Arc<dyn RankEvaluator> = elastic;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(event = "shutdown_requested");
            let _ = tx.send(true);
        }
    });

    Worker::new(store, evaluator, cfg).run(rx).await
}
