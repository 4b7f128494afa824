use station_gateway::api::rest::{create_router, SharedAppState};
use station_gateway::config::settings::Settings;
use station_gateway::dispatch::dispatcher::TriggerDispatcher;
use station_gateway::logging::{init_logging, spawn_file_sink};
use station_gateway::orchestrator::{CommunicationOrchestrator, ReloadOutcome};
use station_gateway::triggers::{LogSubscriber, TriggerRouter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

const CHANGE_FEED_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let start_time = Instant::now();

    // --- Load Configuration ---
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let settings = match Settings::load(&config_path) {
        Ok(s) => s,
        Err(e) => {
            init_logging("info", None);
            error!(
                "FATAL: Failed to load configuration from {:?}: {}",
                config_path, e
            );
            std::process::exit(1);
        }
    };
    match &settings.logging.file {
        Some(path) => {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            spawn_file_sink(path.clone(), rx).await?;
            init_logging(&settings.logging.level, Some(tx));
        }
        None => init_logging(&settings.logging.level, None),
    }
    if let Err(e) = settings.validate() {
        error!("FATAL: Invalid configuration in {:?}: {}", config_path, e);
        std::process::exit(1);
    }
    info!(
        "Station gateway starting: {} channels, {} tags",
        settings.channels.len(),
        settings.tags.len()
    );

    // --- Trigger Dispatcher ---
    let dispatcher = TriggerDispatcher::new(settings.dispatcher.clone());
    dispatcher.subscribe(Arc::new(LogSubscriber));
    dispatcher.start();

    // --- Channels and Tags ---
    let orchestrator = CommunicationOrchestrator::new();
    let router = TriggerRouter::new(Arc::clone(&dispatcher), settings.trigger_rules());
    let router_task = router.spawn(orchestrator.change_feed(CHANGE_FEED_CAPACITY));
    match orchestrator.reload(&settings).await? {
        ReloadOutcome::Applied => info!("Channels started"),
        ReloadOutcome::Skipped => warn!("Initial reload skipped"),
    }

    // --- Start API Server ---
    let app_state = SharedAppState {
        orchestrator: Arc::clone(&orchestrator),
        dispatcher: Arc::clone(&dispatcher),
        start_time,
    };
    let app = create_router(app_state, &settings.server);
    if settings.server.username.is_none() {
        warn!("API basic auth disabled: no credentials configured");
    }

    let addr: SocketAddr = settings.server.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    // --- Shutdown ---
    // Dropping the feed receiver releases a poll tick waiting on it.
    router_task.abort();
    orchestrator.shutdown().await;
    dispatcher.shutdown().await;
    info!("Station gateway stopped");
    Ok(())
}
