use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use huddle_server::api;
use huddle_server::config::AppConfig;
use huddle_server::gateway::GatewayState;
use huddle_server::gateway::adapter::ClusterAdapter;
use huddle_server::media::room::RoomRegistry;
use huddle_server::media::workers::WorkerPool;
use huddle_server::services::jobs_client::JobsClient;
use huddle_server::services::locks::LockService;
use huddle_server::services::msgqueue::MessageQueueManager;
use huddle_server::services::outbox::Outbox;
use huddle_server::services::sessions::SessionRegistry;
use huddle_server::sidetap::store::TranscriptStore;
use huddle_server::sidetap::{self, SideTapManager};
use huddle_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = Arc::new(AppConfig::load()?);
    tracing::info!("Starting huddle server");

    // Connect to Redis
    let redis_client = redis::Client::open(config.redis.url())?;
    let redis = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
    tracing::info!("Redis connected");

    // Spawn media workers
    let workers = WorkerPool::spawn(config.media.clone()).await?;

    // Build application state
    let gateway = Arc::new(GatewayState::new());
    let adapter = Arc::new(ClusterAdapter::new(
        gateway.node_id().to_string(),
        redis.clone(),
    ));
    gateway.set_adapter(Arc::clone(&adapter));

    let outbox = Arc::new(Outbox::new(redis.clone(), config.outbox.clone()));
    let state = AppState {
        config: Arc::clone(&config),
        redis: redis.clone(),
        gateway: Arc::clone(&gateway),
        sessions: Arc::new(SessionRegistry::new(redis.clone())),
        locks: Arc::new(LockService::new(redis.clone(), config.locks.clone())),
        queues: MessageQueueManager::new(Duration::from_secs(config.chat.queue_idle_secs)),
        outbox: Arc::clone(&outbox),
        jobs: Arc::new(JobsClient::new(&config.jobs)?),
        workers,
        rooms: Arc::new(RoomRegistry::new()),
        sidetap: Arc::new(SideTapManager::new(config.sidetap.clone())),
        transcripts: Arc::new(TranscriptStore::new(config.sidetap.transcript_dir.clone())),
    };

    // Background tasks: cluster fan-in, outbox drain, segment watcher
    let subscriber = ClusterAdapter::spawn_subscriber(Arc::clone(&gateway), redis_client);
    let drainer = outbox.spawn_drainer();
    let watcher = sidetap::watcher::spawn_watcher(state.clone());

    // Build router
    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly teardown: stop taps (ports returned, spools flushed), stop the
    // queue sweeper and outbox drainer, then drop the worker pool.
    state.sidetap.stop_all().await;
    state.queues.destroy().await;
    state.outbox.shutdown();
    drainer.abort();
    watcher.abort();
    subscriber.abort();
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutting down...");
}
