//! Sandbar control service binary.
//!
//! Wires the store, git mirror cache, container orchestration and proxy
//! reconciler together and serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sandbar_control::api::{self, AppState};
use sandbar_control::{
    CommandRunner, ControlConfig, DeploymentManager, DeploymentStore, GitCacheManager,
    ProxyReconciler, SqliteStore, VersionCatalog,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sandbar_control=info".parse()?),
        )
        .init();

    info!("sandbar control service starting");

    // Load configuration
    let config = ControlConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        listen_addr = %config.server.listen_addr,
        database = %config.database.url,
        deployments_dir = %config.paths.deployments_dir,
        proxy_enabled = config.proxy.enabled,
        "configuration loaded"
    );

    let runner = CommandRunner::new(
        config.deployment.retry_attempts,
        Duration::from_secs(config.deployment.retry_delay_secs),
    );

    let store: Arc<dyn DeploymentStore> =
        Arc::new(SqliteStore::connect(&config.database, config.ports.clone()).await?);
    let git = Arc::new(GitCacheManager::new(
        &config.git,
        &config.paths,
        runner.clone(),
    ));
    let catalog = Arc::new(VersionCatalog::new(Arc::clone(&git), config.git.clone()));
    let proxy = config
        .proxy
        .enabled
        .then(|| Arc::new(ProxyReconciler::new(config.proxy.clone(), runner.clone())));

    let manager = Arc::new(DeploymentManager::new(
        Arc::clone(&store),
        Arc::clone(&git),
        proxy.clone(),
        runner,
        config.clone(),
    ));

    // Correct any status drift accumulated while the service was down.
    match manager.sync_states().await {
        Ok(report) => info!(
            checked = report.checked,
            updated = report.updated,
            errors = report.errors.len(),
            "state sync complete"
        ),
        Err(e) => warn!(error = %e, "initial state sync failed"),
    }

    if let Some(proxy) = &proxy {
        let deployments = store
            .list(&sandbar_control::DeploymentFilter::new())
            .await?;
        let report = proxy.reconcile(&deployments).await;
        info!(
            checked = report.checked,
            created = report.created,
            removed = report.removed,
            errors = report.errors.len(),
            "proxy reconciliation complete"
        );
    }

    let state = AppState {
        manager,
        store,
        catalog,
    };

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "listening");
    axum::serve(listener, api::router(state)).await?;

    Ok(())
}
