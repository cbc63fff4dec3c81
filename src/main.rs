mod api;
mod config;
mod error;
mod models;
mod paths;
mod recovery;
mod repository;
mod services;

use crate::config::Config;
use crate::recovery::{HttpRecoveryService, SharedRecoveryService};
use crate::repository::{
    ClaimRepository, ExecutionRepository, PlanRepository, establish_connection,
};
use crate::services::{AdmissionGuard, CoordinatorSettings, ExecutionCoordinator, JobPoller};
use api::create_router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn run_server<F>(shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "recovery_orchestrator=debug,tower_http=debug,axum=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting recovery_orchestrator with config: {:?}", config);

    if let Some(path) = config.database_url.strip_prefix("sqlite:") {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Establish database connection
    let db_pool = establish_connection(&config.database_url).await?;
    tracing::info!("Database connected: {}", config.database_url);

    // Initialize repositories
    let plan_repo = PlanRepository::new(db_pool.clone());
    let claim_repo = ClaimRepository::new(db_pool.clone());
    let execution_repo = ExecutionRepository::new(db_pool);

    if let Some(plans_file) = &config.plans_file {
        let imported = plan_repo.import_file(plans_file).await?;
        tracing::info!("Imported {} recovery plan(s) from {}", imported, plans_file.display());
    }

    // Initialize services
    let recovery: SharedRecoveryService = Arc::new(HttpRecoveryService::new(
        &config.recovery_service_url,
        config.request_timeout(),
    )?);
    let settings = CoordinatorSettings::from(&config);
    let guard = AdmissionGuard::new(claim_repo, recovery.clone(), settings.call_timeout);
    let coordinator = ExecutionCoordinator::new(
        execution_repo.clone(),
        plan_repo,
        guard,
        recovery.clone(),
        settings,
    );
    let poller = JobPoller::new(coordinator.clone(), execution_repo, recovery);

    let (poller_tx, poller_rx) = watch::channel(false);
    let poller_handle = tokio::spawn(poller.run(config.poll_interval(), poller_rx));

    // Create router
    let app = create_router(coordinator);
    let app = app.layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let addr = addr.parse::<SocketAddr>()?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let _ = poller_tx.send(true);
    if let Err(err) = poller_handle.await {
        tracing::error!("Job poller task failed: {}", err);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_server(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    })
    .await
}
