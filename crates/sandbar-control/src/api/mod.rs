//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Deployment management (create, query, lifecycle, delete)
//! - Version discovery
//! - State reconciliation sweeps
//! - Health and readiness checks
//! - Prometheus metrics

mod deployments;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;

use crate::deployment::DeploymentManager;
use crate::store::DeploymentStore;
use crate::versions::VersionCatalog;

pub use deployments::{
    CreateDeploymentRequest, DeploymentResponse, ListDeploymentsQuery, UpdateDeploymentRequest,
};

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Deployment manager for orchestrating deployments.
    pub manager: Arc<DeploymentManager>,
    /// Deployment store for direct queries.
    pub store: Arc<dyn DeploymentStore>,
    /// Version catalog for selectable refs.
    pub catalog: Arc<VersionCatalog>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Deployment management
        .route("/deployments", post(deployments::create_deployment))
        .route("/deployments", get(deployments::list_deployments))
        .route("/deployments/sync", post(deployments::sync_deployments))
        .route("/deployments/{id}", get(deployments::get_deployment))
        .route("/deployments/{id}", delete(deployments::delete_deployment))
        .route("/deployments/{id}/status", get(deployments::deployment_status))
        .route("/deployments/{id}/logs", get(deployments::deployment_logs))
        .route("/deployments/{id}/stop", post(deployments::stop_deployment))
        .route("/deployments/{id}/start", post(deployments::start_deployment))
        .route(
            "/deployments/{id}/restart",
            post(deployments::restart_deployment),
        )
        .route(
            "/deployments/{id}/update",
            post(deployments::update_deployment),
        )
        // Version discovery
        .route("/versions", get(list_versions))
        .route("/versions/dependencies", get(list_dependency_versions))
        // Metrics
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    deployments: usize,
}

#[derive(Debug, Serialize)]
struct VersionsResponse {
    versions: Vec<String>,
}

/// Health check endpoint.
async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint; unready when the store is unreachable.
async fn readiness_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> (axum::http::StatusCode, axum::Json<ReadyResponse>) {
    match state.store.list(&crate::store::DeploymentFilter::new()).await {
        Ok(deployments) => (
            axum::http::StatusCode::OK,
            axum::Json(ReadyResponse {
                ready: true,
                deployments: deployments.len(),
            }),
        ),
        Err(_) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReadyResponse {
                ready: false,
                deployments: 0,
            }),
        ),
    }
}

/// Selectable versions for the primary module repository.
async fn list_versions(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<VersionsResponse> {
    axum::Json(VersionsResponse {
        versions: state.catalog.primary_versions().await,
    })
}

/// Selectable versions per dependency repository.
async fn list_dependency_versions(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<
    axum::Json<BTreeMap<String, Vec<String>>>,
    (axum::http::StatusCode, String),
> {
    state
        .catalog
        .available_dependencies()
        .await
        .map(axum::Json)
        .map_err(|e| {
            (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                e.to_string(),
            )
        })
}

/// Metrics endpoint.
async fn metrics(axum::extract::State(state): axum::extract::State<AppState>) -> String {
    let mut output = String::new();
    output.push_str("# HELP control_deployments_total Number of deployments by status\n");
    output.push_str("# TYPE control_deployments_total gauge\n");

    match state.manager.metrics().await {
        Ok(counts) => {
            for (label, count) in [
                ("creating", counts.creating),
                ("running", counts.running),
                ("stopped", counts.stopped),
                ("error", counts.error),
                ("updating", counts.updating),
            ] {
                let _ = writeln!(
                    output,
                    "control_deployments_total{{status=\"{label}\"}} {count}"
                );
            }
        }
        Err(e) => {
            let _ = writeln!(output, "# store unavailable: {e}");
        }
    }
    output
}
