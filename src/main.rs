use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::info;

use pare::classify::EmailClassifier;
use pare::config::{
    ClassifierConfig, GoogleConfig, QueueConfig, StoreConfig, SyncConfig, TickConfig,
};
use pare::llm::create_provider;
use pare::mail::{GmailConnector, StoredTokenProvider};
use pare::pipeline::{ClassificationPipeline, SyncPipeline};
use pare::store::StorageGateway;
use pare::worker::{BackgroundTicker, JobQueue, default_registry, spawn_tick_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let store_config = StoreConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let sync_config = SyncConfig::from_env();
    let classifier_config = ClassifierConfig::from_env();
    let google_config = GoogleConfig::from_env();
    let tick_config = TickConfig::from_env();

    eprintln!("📬 Pare v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", store_config.db_path.display());
    eprintln!("   Model: {}", classifier_config.model);
    eprintln!("   Workers: {}", queue_config.workers);
    eprintln!("   Tick every {}s\n", tick_config.interval.as_secs());

    // ── Storage ─────────────────────────────────────────────────────────
    let gateway = StorageGateway::open(&store_config)
        .await
        .with_context(|| format!("opening database at {}", store_config.db_path.display()))?;

    // ── Mailbox access ──────────────────────────────────────────────────
    let api_base = google_config.api_base.clone();
    let tokens = Arc::new(StoredTokenProvider::new(gateway.clone(), google_config));
    let connector = Arc::new(GmailConnector::new(tokens, api_base));

    // ── Classification ──────────────────────────────────────────────────
    let llm = create_provider(&classifier_config);
    if llm.is_none() {
        eprintln!("   No classifier API key set, every message will be filed as other");
    }
    let classifier = Arc::new(EmailClassifier::new(llm, &classifier_config));

    // ── Jobs ────────────────────────────────────────────────────────────
    let sync = Arc::new(SyncPipeline::new(gateway.clone(), connector, sync_config));
    let classification = Arc::new(ClassificationPipeline::new(
        gateway.clone(),
        classifier,
        classifier_config,
    ));
    let registry = Arc::new(default_registry(sync, classification));
    let queue = JobQueue::start(registry, &queue_config);

    let interval = tick_config.interval;
    let ticker = Arc::new(BackgroundTicker::new(Arc::clone(&queue), gateway, tick_config));
    let (tick_handle, tick_shutdown) = spawn_tick_loop(ticker, interval);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    tick_shutdown.store(true, Ordering::Relaxed);
    tick_handle.abort();
    queue.shutdown().await;

    info!("Pare stopped");
    Ok(())
}
