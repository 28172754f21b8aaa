//! Deployment management endpoints.

use std::collections::BTreeMap;
use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deployment::{CreateParams, DeploymentDetail, SyncReport};
use crate::error::ControlError;
use crate::store::DeploymentFilter;
use crate::types::{Deployment, DeploymentId, DeploymentStatus, Environment};

use super::AppState;

/// Request to create a new deployment.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    /// Deployment name, unique per tester.
    pub name: String,
    /// Owning tester's email.
    pub tester_email: String,
    /// Branch or tag of the primary module repository.
    pub primary_version: String,
    /// Per-dependency version overrides.
    #[serde(default)]
    pub dependency_versions: BTreeMap<String, String>,
    /// Environment profile; defaults to devel.
    #[serde(default)]
    pub environment: Option<String>,
    /// Basic-auth password; generated when absent.
    #[serde(default)]
    pub auth_password: Option<String>,
}

/// Request to update a deployment to a new version.
#[derive(Debug, Deserialize)]
pub struct UpdateDeploymentRequest {
    /// New primary version.
    pub primary_version: String,
    /// Reset the database instead of migrating it.
    #[serde(default)]
    pub reset_db: bool,
}

/// Query parameters for listing deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Filter by tester email.
    pub tester_email: Option<String>,
    /// Filter by status.
    pub status: Option<String>,
    /// Filter by environment.
    pub environment: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Query parameters for fetching logs.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Restrict to one service.
    pub service: Option<String>,
    /// Number of trailing lines.
    pub tail: Option<u32>,
}

/// Query parameters for restarting.
#[derive(Debug, Default, Deserialize)]
pub struct RestartQuery {
    /// Restart containers in place instead of a full stop/start cycle.
    #[serde(default)]
    pub quick: bool,
}

/// Response for a deployment.
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    /// Deployment ID.
    pub id: String,
    /// Deployment name.
    pub name: String,
    /// Owning tester.
    pub tester_email: String,
    /// Primary version.
    pub primary_version: String,
    /// Dependency overrides.
    pub dependency_versions: BTreeMap<String, String>,
    /// Environment profile.
    pub environment: String,
    /// Current status.
    pub status: String,
    /// Base of the owned port block.
    pub port_base: u16,
    /// Derived service ports.
    pub ports: BTreeMap<String, u16>,
    /// Proxy subdomain.
    pub subdomain: String,
    /// Most recent action or failure diagnostic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub last_updated: String,
}

/// Generic outcome message.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Human-readable outcome.
    pub message: String,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create a new deployment. Runs the bring-up sequence to completion, so
/// the response reports the final status.
pub async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentResponse>), ApiError> {
    let environment = match request.environment.as_deref() {
        None => Environment::Devel,
        Some(s) => Environment::from_str(s)
            .map_err(|e| api_error(&ControlError::Validation(vec![e])))?,
    };

    info!(
        name = %request.name,
        tester_email = %request.tester_email,
        version = %request.primary_version,
        "creating deployment via API"
    );

    let params = CreateParams {
        name: request.name,
        tester_email: request.tester_email,
        primary_version: request.primary_version,
        dependency_versions: request.dependency_versions,
        environment,
        auth_password: request.auth_password,
    };

    match state.manager.create(params, None).await {
        Ok(deployment) => Ok((StatusCode::CREATED, Json(to_response(deployment)))),
        Err(e) => Err(api_error(&e)),
    }
}

/// Get a deployment by ID.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let deployment_id = DeploymentId::new(&id);
    match state.store.get(&deployment_id).await {
        Ok(Some(deployment)) => Ok(Json(to_response(deployment))),
        Ok(None) => Err(api_error(&ControlError::NotFound(id))),
        Err(e) => Err(api_error(&e)),
    }
}

/// List deployments with optional filters.
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<DeploymentResponse>>, ApiError> {
    let mut filter = DeploymentFilter::new();
    if let Some(tester_email) = query.tester_email {
        filter = filter.with_tester(tester_email);
    }
    if let Some(status) = query.status {
        let status = DeploymentStatus::from_str(&status)
            .map_err(|e| api_error(&ControlError::Validation(vec![e])))?;
        filter = filter.with_status(status);
    }
    if let Some(environment) = query.environment {
        let environment = Environment::from_str(&environment)
            .map_err(|e| api_error(&ControlError::Validation(vec![e])))?;
        filter = filter.with_environment(environment);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    match state.store.list(&filter).await {
        Ok(deployments) => Ok(Json(deployments.into_iter().map(to_response).collect())),
        Err(e) => Err(api_error(&e)),
    }
}

/// Live status detail: record plus container status and stats.
pub async fn deployment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentDetail>, ApiError> {
    state
        .manager
        .status(&DeploymentId::new(id))
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Recent service logs.
pub async fn deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<String, ApiError> {
    state
        .manager
        .logs(
            &DeploymentId::new(id),
            query.service.as_deref(),
            query.tail.unwrap_or(100),
        )
        .await
        .map_err(|e| api_error(&e))
}

/// Stop a deployment's containers.
pub async fn stop_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .manager
        .stop(&DeploymentId::new(id))
        .await
        .map(|()| message("deployment stopped"))
        .map_err(|e| api_error(&e))
}

/// Start a stopped deployment.
pub async fn start_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .manager
        .start(&DeploymentId::new(id))
        .await
        .map(|()| message("deployment started"))
        .map_err(|e| api_error(&e))
}

/// Restart a deployment.
pub async fn restart_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RestartQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .manager
        .restart(&DeploymentId::new(id), query.quick)
        .await
        .map(|()| message("deployment restarted"))
        .map_err(|e| api_error(&e))
}

/// Update a deployment to a new primary version.
pub async fn update_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateDeploymentRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!(deployment_id = %id, version = %request.primary_version, "updating deployment via API");
    state
        .manager
        .update(
            &DeploymentId::new(id),
            &request.primary_version,
            request.reset_db,
        )
        .await
        .map(|msg| message(msg))
        .map_err(|e| api_error(&e))
}

/// Delete a deployment completely.
pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!(deployment_id = %id, "deleting deployment via API");
    state
        .manager
        .delete(&DeploymentId::new(id))
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| api_error(&e))
}

/// Run the drift-correction sweep.
pub async fn sync_deployments(
    State(state): State<AppState>,
) -> Result<Json<SyncReport>, ApiError> {
    state
        .manager
        .sync_states()
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

fn message(text: impl Into<String>) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: text.into(),
    })
}

fn to_response(deployment: Deployment) -> DeploymentResponse {
    DeploymentResponse {
        id: deployment.id.to_string(),
        ports: deployment.port_mappings(),
        name: deployment.name,
        tester_email: deployment.tester_email,
        primary_version: deployment.primary_version,
        dependency_versions: deployment.dependency_versions,
        environment: deployment.environment.as_str().to_owned(),
        status: deployment.status.as_str().to_owned(),
        port_base: deployment.port_base,
        subdomain: deployment.subdomain,
        last_action: deployment.last_action,
        created_at: deployment.created_at.to_rfc3339(),
        last_updated: deployment.last_updated.to_rfc3339(),
    }
}

fn api_error(error: &ControlError) -> ApiError {
    (
        error_to_status(error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

const fn error_to_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::Validation(_) | ControlError::Config(_) => StatusCode::BAD_REQUEST,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::InvalidStatus { .. } => StatusCode::CONFLICT,
        ControlError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        ControlError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::deployment::DeploymentManager;
    use crate::gitcache::GitCacheManager;
    use crate::process::CommandRunner;
    use crate::store::{DeploymentStore, MemoryStore};
    use crate::versions::VersionCatalog;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_app_state() -> AppState {
        let tmp = std::env::temp_dir().join(format!(
            "sandbar-api-test-{}",
            crate::deployment::manager::generate_password()
        ));
        let mut config = ControlConfig::default();
        config.paths.deployments_dir = tmp.join("deployments").display().to_string();
        config.paths.git_cache_dir = tmp.join("git-cache").display().to_string();

        let runner = CommandRunner::new(1, Duration::ZERO);
        let store: Arc<dyn DeploymentStore> = Arc::new(MemoryStore::new(config.ports.clone()));
        let git = Arc::new(GitCacheManager::new(
            &config.git,
            &config.paths,
            runner.clone(),
        ));
        let catalog = Arc::new(VersionCatalog::new(Arc::clone(&git), config.git.clone()));
        let manager = Arc::new(DeploymentManager::new(
            Arc::clone(&store),
            git,
            None,
            runner,
            config,
        ));
        AppState {
            manager,
            store,
            catalog,
        }
    }

    #[tokio::test]
    async fn list_deployments_empty() {
        let state = make_app_state();
        let app = super::super::router(state);

        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_deployment_not_found() {
        let state = make_app_state();
        let app = super::super::router(state);

        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments/nonexistent-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_with_invalid_params_is_a_bad_request() {
        let state = make_app_state();
        let app = super::super::router(state);

        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let body = serde_json::json!({
            "name": "x",
            "tester_email": "not-an-email",
            "primary_version": "17.0",
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/deployments")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let state = make_app_state();
        let app = super::super::router(state);

        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/deployments/never-existed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn stop_of_missing_deployment_is_not_found() {
        let state = make_app_state();
        let app = super::super::router(state);

        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/deployments/nonexistent-id/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let state = make_app_state();
        let app = super::super::router(state);

        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
