use anyhow::{Context, Result};
use history::api::{start_api_server, AppState};
use history::clients::{AuthClient, DataBrokerClient, DeviceManagerClient};
use history::config::Config;
use history::consumer::KafkaBus;
use history::index_manager::IndexManager;
use history::logging::init_tracing;
use history::mongo_store::MongoStore;
use history::persister::Persister;
use history::store::HistoryStore;
use history::supervisor::{Supervisor, SupervisorSettings};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    let log_control = init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting History Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Storage
    let mongo = MongoStore::connect(&config.mongo)
        .await
        .context("Failed to initialize MongoDB client")?;
    mongo.ping().await.context("MongoDB is not reachable")?;
    let store: Arc<dyn HistoryStore> = Arc::new(mongo.clone());

    let indexes = IndexManager::new(store.clone(), config.data_expiration());
    let persister = Arc::new(Persister::new(store.clone(), indexes.clone()));

    // External collaborators
    let timeout = config.request_timeout();
    let auth = AuthClient::new(&config.services.auth_url, timeout)
        .context("Failed to initialize auth client")?;
    let data_broker = DataBrokerClient::new(&config.services.data_broker_url, timeout)
        .context("Failed to initialize data broker client")?;
    let device_manager = DeviceManagerClient::new(&config.services.device_manager_url, timeout)
        .context("Failed to initialize device manager client")?;

    let supervisor = Supervisor::new(
        Arc::new(KafkaBus::new(config.kafka.clone())),
        Arc::new(data_broker),
        Arc::new(auth),
        persister,
        SupervisorSettings {
            subjects: config.subjects.clone(),
            notifications_only: config.persister.notifications_only,
        },
    );

    if let Err(e) = supervisor.start().await {
        supervisor.shutdown().await;
        mongo.shutdown().await;
        return Err(e).context("Failed to bootstrap tenant listeners");
    }

    // Create API state
    let api_state = AppState {
        store,
        registry: Arc::new(device_manager),
        indexes,
        log_control,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        listeners = supervisor.listener_count(),
        "History service started successfully"
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down history service");

    supervisor.shutdown().await;
    api_handle.abort();
    mongo.shutdown().await;

    info!("History service stopped");

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
