/// Server setup and initialization
///
/// Wires together all components: storage, registry, node handlers, execution engine,
/// run records, triggers and HTTP routes. Every service is built here and passed
/// down explicitly.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    runtime::{
        backend::{HttpModelBackend, ModelBackend, UnconfiguredModelBackend},
        BroadcastEventSink, EventSink, FanoutEventSink, GraphExecutor, NodeRegistry, TracingEventSink,
        WorkflowRunner,
    },
    store::{MemoryStore, SqliteStore, Store},
    trigger::{AxumWebhookListener, TriggerManager, WebhookListener},
    workflow::registry::WorkflowRegistry,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the lifecycle event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Every long-lived service of a running engine
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub registry: Arc<WorkflowRegistry>,
    pub runner: Arc<WorkflowRunner>,
    pub triggers: Arc<TriggerManager>,
    /// Lifecycle events for in-process subscribers
    pub events: Arc<BroadcastEventSink>,
    pub shutdown: CancellationToken,
}

impl Services {
    /// Stop the cron loop and the webhook listener
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.triggers.shutdown().await;
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            runner: Arc::clone(&self.runner),
            triggers: Arc::clone(&self.triggers),
        }
    }

    /// Control API router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(health_check))
            .merge(create_api_routes().with_state(self.app_state()))
    }

    /// Spawn the cron tick loop, stopped by `shutdown`
    pub fn spawn_cron_loop(&self, tick: Duration) -> JoinHandle<()> {
        self.triggers.cron().spawn(tick, self.shutdown.clone())
    }
}

/// Open the configured store
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    if config.database.in_memory() {
        tracing::info!("🧠 Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;
    let store = SqliteStore::connect(config.database.database_path()).await?;
    Ok(Arc::new(store))
}

/// Model backend from config; without an endpoint, model nodes fail with a clear error
pub fn model_backend(config: &Config) -> Result<Arc<dyn ModelBackend>> {
    match &config.model.endpoint {
        Some(endpoint) => {
            tracing::info!("🤖 Model backend: {}", endpoint);
            Ok(Arc::new(HttpModelBackend::new(endpoint.clone(), config.model.api_key.clone())?))
        }
        None => {
            tracing::warn!("⚠️ WIREFLOW_MODEL_ENDPOINT not set; llm nodes will fail");
            Ok(Arc::new(UnconfiguredModelBackend))
        }
    }
}

/// Build every service over the given collaborators
pub async fn build_services(
    config: &Config,
    store: Arc<dyn Store>,
    model: Arc<dyn ModelBackend>,
    listener: Arc<dyn WebhookListener>,
) -> Result<Services> {
    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&store)));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    tracing::info!("⚙️ Initializing node handlers");
    let nodes = NodeRegistry::with_defaults(model, Arc::clone(&registry), config.execution.shell_timeout_secs);
    let executor = Arc::new(GraphExecutor::new(nodes, config.engine_limits()));

    let events = Arc::new(BroadcastEventSink::new(EVENT_CHANNEL_CAPACITY));
    let sink: Arc<dyn EventSink> = Arc::new(FanoutEventSink::new(vec![
        Arc::new(TracingEventSink),
        Arc::clone(&events) as Arc<dyn EventSink>,
    ]));

    tracing::info!("🚀 Initializing workflow runner");
    let runner = Arc::new(WorkflowRunner::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        executor,
        sink,
    ));

    tracing::info!("🔔 Initializing trigger manager");
    let triggers = Arc::new(TriggerManager::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&runner) as Arc<dyn crate::runtime::RunLauncher>,
        listener,
        config.trigger_settings(),
    ));

    Ok(Services {
        store,
        registry,
        runner,
        triggers,
        events,
        shutdown: CancellationToken::new(),
    })
}

/// Create the main Axum application with all routes
///
/// Opens storage, builds the services, re-arms persisted triggers and starts the
/// cron loop.
pub async fn create_app(config: Config) -> Result<(Router, Services)> {
    let store = open_store(&config).await?;
    let model = model_backend(&config)?;
    let webhook_addr: SocketAddr = format!("{}:{}", config.webhook.host, config.webhook.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid webhook listener address: {}", e))?;
    let listener = Arc::new(AxumWebhookListener::new(webhook_addr));

    let services = build_services(&config, store, model, listener).await?;

    tracing::info!("♻️ Restoring armed triggers");
    if let Err(e) = services.triggers.restore_armed().await {
        tracing::error!("❌ Failed to restore triggers: {}", e);
    }

    tracing::info!("⏰ Starting cron loop");
    services.spawn_cron_loop(Duration::from_millis(config.cron.tick_ms.max(10)));

    let app = services.router();
    tracing::info!("✅ Application initialized successfully");
    Ok((app, services))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting wireflow server...");

    let (app, services) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("👋 Shutting down");
    services.shutdown().await;
    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
