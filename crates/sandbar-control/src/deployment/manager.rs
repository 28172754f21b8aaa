//! Deployment lifecycle orchestration.
//!
//! The manager is the single place that decides status transitions. Every
//! phase collaborator (store, git cache, container orchestrator, proxy)
//! reports success or failure as a value; a failure during create or update
//! is recorded in the deployment's `last_action` before any cleanup runs,
//! so the reason survives even when cleanup itself fails.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::compose::{ContainerOrchestrator, ServiceStats, ServiceStatus};
use crate::config::ControlConfig;
use crate::deployment::{environment, manifest};
use crate::error::{ControlError, ControlResult};
use crate::gitcache::GitCacheManager;
use crate::process::{Cmd, CommandRunner};
use crate::proxy::ProxyReconciler;
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::types::{
    valid_deployment_name, valid_email, Deployment, DeploymentId, DeploymentStatus, Environment,
};

/// Ordered bring-up sequence: task, extra arguments, expected duration in
/// seconds. Expected durations feed progress reporting only; no task has an
/// enforced timeout.
const BRINGUP_TASKS: &[(&str, &[&str], u64)] = &[
    ("develop", &[], 5),
    ("img-pull", &[], 30),
    ("img-build", &[], 120),
    ("git-aggregate", &[], 45),
    ("resetdb", &[], 60),
    ("start", &["--detach"], 15),
];

const AGGREGATE_TASK: &str = "git-aggregate";

/// Parameters for creating a deployment.
#[derive(Debug, Clone)]
pub struct CreateParams {
    /// Deployment name, unique per tester.
    pub name: String,
    /// Owning tester's email.
    pub tester_email: String,
    /// Branch or tag of the primary module repository.
    pub primary_version: String,
    /// Per-dependency version overrides.
    pub dependency_versions: BTreeMap<String, String>,
    /// Environment profile.
    pub environment: Environment,
    /// Basic-auth password; generated when absent.
    pub auth_password: Option<String>,
}

/// One progress update emitted during create.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseEvent {
    /// Phase or task name.
    pub phase: String,
    /// Human-readable detail.
    pub detail: String,
}

/// Channel end progress events are sent to; a dropped receiver is ignored.
pub type ProgressSender = mpsc::UnboundedSender<PhaseEvent>;

/// Detailed runtime view of one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentDetail {
    /// The persisted record.
    pub deployment: Deployment,
    /// Per-service container status.
    pub containers: BTreeMap<String, ServiceStatus>,
    /// Per-service resource usage.
    pub stats: BTreeMap<String, ServiceStats>,
}

/// Outcome of a state-reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Deployments examined.
    pub checked: u32,
    /// Records whose status was corrected.
    pub updated: u32,
    /// Per-deployment failures; one failure never aborts the sweep.
    pub errors: Vec<String>,
}

/// Aggregate deployment counts by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentMetrics {
    pub total: u32,
    pub creating: u32,
    pub running: u32,
    pub stopped: u32,
    pub error: u32,
    pub updating: u32,
}

/// Orchestrates the deployment lifecycle end to end.
#[derive(Debug)]
pub struct DeploymentManager {
    store: Arc<dyn DeploymentStore>,
    git: Arc<GitCacheManager>,
    proxy: Option<Arc<ProxyReconciler>>,
    runner: CommandRunner,
    config: ControlConfig,
}

impl DeploymentManager {
    /// Wire up a manager over its collaborators. `proxy` is `None` when
    /// proxy-based routing is disabled.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        git: Arc<GitCacheManager>,
        proxy: Option<Arc<ProxyReconciler>>,
        runner: CommandRunner,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            git,
            proxy,
            runner,
            config,
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    fn deployment_dir(&self, id: &DeploymentId) -> PathBuf {
        PathBuf::from(&self.config.paths.deployments_dir).join(id.as_str())
    }

    fn compose_dir(&self, id: &DeploymentId) -> PathBuf {
        self.deployment_dir(id).join("openspp-docker")
    }

    fn orchestrator(&self, id: &DeploymentId) -> ContainerOrchestrator {
        ContainerOrchestrator::new(
            self.config.compose.clone(),
            self.runner.clone(),
            id,
            self.compose_dir(id),
        )
    }

    /// Create a deployment end to end. Ends in exactly `Running` or
    /// `Error` (then cleaned up) — never returns with the record left at
    /// `Creating`.
    pub async fn create(
        &self,
        params: CreateParams,
        progress: Option<ProgressSender>,
    ) -> ControlResult<Deployment> {
        let violations = validate(&params);
        if !violations.is_empty() {
            return Err(ControlError::Validation(violations));
        }

        let current = self.store.count_for_tester(&params.tester_email).await?;
        let max = self.config.deployment.max_per_tester;
        if current >= max {
            return Err(ControlError::QuotaExceeded {
                tester: params.tester_email,
                current,
                max,
            });
        }

        let password = params.auth_password.unwrap_or_else(generate_password);
        let mut deployment = Deployment::new(
            params.name,
            params.tester_email,
            params.primary_version,
            params.dependency_versions,
            params.environment,
            password,
        );

        if self.store.get(&deployment.id).await?.is_some() {
            return Err(ControlError::Validation(vec![format!(
                "deployment {} already exists",
                deployment.id
            )]));
        }

        // Allocation also persists the initial creating record, atomically.
        deployment.port_base = self
            .store
            .allocate_port(&deployment, self.config.ports.increment)
            .await?;
        info!(
            deployment_id = %deployment.id,
            port_base = deployment.port_base,
            version = %deployment.primary_version,
            "creating deployment"
        );

        match self.provision(&mut deployment, progress.as_ref()).await {
            Ok(()) => {
                self.store.save(&deployment).await?;
                info!(deployment_id = %deployment.id, status = %deployment.status, "deployment created");
                Ok(deployment)
            }
            Err(e) => {
                error!(deployment_id = %deployment.id, error = %e, "deployment creation failed");
                deployment.status = DeploymentStatus::Error;
                deployment.last_action = Some(format!("Creation failed: {e}"));
                if let Err(save_err) = self.store.save(&deployment).await {
                    warn!(deployment_id = %deployment.id, error = %save_err, "failed to record failure");
                }
                self.cleanup_failed(&deployment).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        deployment: &mut Deployment,
        progress: Option<&ProgressSender>,
    ) -> ControlResult<()> {
        let dir = self.deployment_dir(&deployment.id);
        let compose_dir = self.compose_dir(&deployment.id);
        tokio::fs::create_dir_all(&dir).await?;

        emit(progress, "materialize", "Preparing source tree");
        self.git
            .copy_to(&self.config.git.primary_repo, &compose_dir, true)
            .await?;
        self.remove_conflicting_sources(&deployment.id).await;

        emit(progress, "manifest", "Pinning dependency versions");
        self.rewrite_manifest(deployment).await?;

        emit(progress, "environment", "Generating environment");
        self.write_env_files(deployment).await?;
        self.write_compose_override(&deployment.id).await?;

        for (task, extra, expected_secs) in BRINGUP_TASKS {
            if *task == AGGREGATE_TASK {
                emit(progress, "prepopulate", "Pre-populating repositories from cache");
                self.prepopulate_sources(&deployment.id).await;
            }

            emit(
                progress,
                task,
                &format!("Running {task} (~{expected_secs}s)"),
            );
            self.run_task(&deployment.id, task, extra).await?;

            if *task == AGGREGATE_TASK {
                self.fix_generated_ports(&deployment.id).await;
            }

            deployment.last_action = Some(format!("Executed {task}"));
            self.store.save(deployment).await?;
        }

        if self.config.deployment.skip_health_check {
            info!(deployment_id = %deployment.id, "health check skipped by configuration");
            deployment.status = DeploymentStatus::Running;
        } else {
            emit(progress, "health", "Waiting for services");
            let healthy = self.orchestrator(&deployment.id).wait_healthy(None).await?;
            if healthy {
                deployment.status = DeploymentStatus::Running;
            } else {
                deployment.status = DeploymentStatus::Error;
                deployment.last_action = Some("Services failed to start".to_owned());
            }
        }

        if let Some(proxy) = &self.proxy {
            emit(progress, "proxy", "Configuring domain routing");
            let message = proxy.setup_domain(deployment).await?;
            debug!(deployment_id = %deployment.id, message, "proxy configured");
        }

        Ok(())
    }

    async fn rewrite_manifest(&self, deployment: &Deployment) -> ControlResult<()> {
        let path = self
            .deployment_dir(&deployment.id)
            .join(manifest::REPOS_YAML_REL);
        let text = tokio::fs::read_to_string(&path).await?;
        let rewritten = manifest::rewrite_repos(
            &text,
            &deployment.primary_version,
            &deployment.dependency_versions,
        )?;
        tokio::fs::write(&path, rewritten).await?;
        Ok(())
    }

    async fn write_env_files(&self, deployment: &Deployment) -> ControlResult<()> {
        let content = environment::render_env_file(
            deployment,
            &self.config.compose.project_prefix,
            &self.config.deployment,
        );
        let dir = self.deployment_dir(&deployment.id);
        tokio::fs::write(dir.join(".env"), &content).await?;
        tokio::fs::write(self.compose_dir(&deployment.id).join(".env"), &content).await?;
        Ok(())
    }

    async fn write_compose_override(&self, id: &DeploymentId) -> ControlResult<()> {
        // Ports come from the environment file; the override exists so the
        // task runner's merge step always finds one.
        let path = self.compose_dir(id).join("docker-compose.override.yml");
        tokio::fs::write(&path, "version: \"3.4\"\nservices: {}\n").await?;
        Ok(())
    }

    /// Remove the vendored copy of the conflicting dependency; aggregation
    /// would otherwise install its modules twice.
    async fn remove_conflicting_sources(&self, id: &DeploymentId) {
        let path = self
            .deployment_dir(id)
            .join(manifest::SRC_DIR_REL)
            .join(manifest::CONFLICTING_DEP);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!(deployment_id = %id, "removed conflicting vendored sources"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(deployment_id = %id, error = %e, "failed to remove vendored sources"),
        }
    }

    /// Copy every manifest repository from the mirror cache into the source
    /// tree so aggregation fetches deltas instead of full clones. Failures
    /// are non-fatal; aggregation falls back to cloning.
    async fn prepopulate_sources(&self, id: &DeploymentId) {
        let manifest_path = self.deployment_dir(id).join(manifest::REPOS_YAML_REL);
        let src_dir = self.deployment_dir(id).join(manifest::SRC_DIR_REL);

        let remotes = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(text) => match manifest::all_remotes(&text) {
                Ok(remotes) => remotes,
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "unreadable manifest, skipping pre-population");
                    return;
                }
            },
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "missing manifest, skipping pre-population");
                return;
            }
        };

        for (name, url) in remotes {
            let dest = src_dir.join(&name);
            if dest.exists() {
                continue;
            }
            debug!(deployment_id = %id, repo = %name, "pre-populating from cache");
            if let Err(e) = self.git.copy_to(&url, &dest, true).await {
                warn!(deployment_id = %id, repo = %name, error = %e, "pre-population failed");
            }
        }
    }

    /// Rewrite literal port bindings the aggregation step generated from
    /// the shared template. Non-fatal: a deployment with untouched bindings
    /// still starts, it just cannot coexist with another one.
    async fn fix_generated_ports(&self, id: &DeploymentId) {
        let path = self.deployment_dir(id).join(manifest::COMPOSE_YAML_REL);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "generated compose file unreadable");
                return;
            }
        };
        let (rewritten, changed) = manifest::rewrite_compose_ports(&text);
        if !changed {
            return;
        }
        match tokio::fs::write(&path, rewritten).await {
            Ok(()) => info!(deployment_id = %id, "replaced literal port bindings"),
            Err(e) => warn!(deployment_id = %id, error = %e, "failed to rewrite port bindings"),
        }
    }

    /// Run one task-runner task in the deployment's source tree with the
    /// generated environment loaded.
    async fn run_task(
        &self,
        id: &DeploymentId,
        task: &str,
        extra: &[&str],
    ) -> ControlResult<String> {
        let compose_dir = self.compose_dir(id);
        if !compose_dir.exists() {
            return Err(ControlError::phase(
                "bring-up",
                format!("working directory missing: {}", compose_dir.display()),
            ));
        }

        let mut cmd = Cmd::new("invoke")
            .arg(task)
            .args(extra.iter().copied())
            .current_dir(&compose_dir);

        let env_path = self.deployment_dir(id).join(".env");
        if let Ok(content) = tokio::fs::read_to_string(&env_path).await {
            for (key, value) in environment::parse_env_file(&content) {
                cmd = cmd.env(key, value);
            }
        }

        info!(deployment_id = %id, task, "running task");
        match self.runner.run(&cmd).await {
            Ok(out) => Ok(out.stdout),
            Err(e) if e.transient => Err(ControlError::Transient(format!(
                "task {task}: {}",
                e.stderr.trim()
            ))),
            Err(e) => Err(ControlError::phase(
                "bring-up",
                format!("task {task} failed: {}", e.stderr.trim()),
            )),
        }
    }

    async fn cleanup_failed(&self, deployment: &Deployment) {
        let id = &deployment.id;
        if self.config.deployment.preserve_failed {
            info!(deployment_id = %id, "preserving failed deployment files for inspection");
            if let Err(e) = self.orchestrator(id).down(true).await {
                warn!(deployment_id = %id, error = %e, "failed to stop containers");
            }
            return;
        }

        info!(deployment_id = %id, "cleaning up failed deployment");
        if self.compose_dir(id).exists() {
            if let Err(e) = self.orchestrator(id).down(true).await {
                warn!(deployment_id = %id, error = %e, "container teardown failed");
            }
        }
        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy.cleanup_domain(id.as_str()).await {
                warn!(deployment_id = %id, error = %e, "proxy cleanup failed");
            }
        }
        self.remove_dir(id).await;
        match self.store.delete(id).await {
            Ok(()) | Err(ControlError::NotFound(_)) => {}
            Err(e) => warn!(deployment_id = %id, error = %e, "failed to delete record"),
        }
    }

    async fn remove_dir(&self, id: &DeploymentId) {
        let dir = self.deployment_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(deployment_id = %id, error = %e, "failed to remove working directory"),
        }
    }

    /// Update a running deployment to a new primary version, optionally
    /// resetting the database. Ends `Running` or `Error`.
    pub async fn update(
        &self,
        id: &DeploymentId,
        new_version: &str,
        reset_db: bool,
    ) -> ControlResult<String> {
        let mut deployment = self.require(id).await?;
        if deployment.status != DeploymentStatus::Running {
            return Err(ControlError::InvalidStatus {
                operation: "update",
                required: DeploymentStatus::Running.as_str(),
                actual: deployment.status.as_str(),
            });
        }

        info!(deployment_id = %id, new_version, reset_db, "updating deployment");
        deployment.status = DeploymentStatus::Updating;
        deployment.primary_version = new_version.to_owned();
        self.store.save(&deployment).await?;

        match self.apply_update(&deployment, reset_db).await {
            Ok(healthy) => {
                if healthy {
                    deployment.status = DeploymentStatus::Running;
                    deployment.last_action = Some(format!("Updated to {new_version}"));
                } else {
                    deployment.status = DeploymentStatus::Error;
                    deployment.last_action =
                        Some("Update failed - services not healthy".to_owned());
                }
                self.store.save(&deployment).await?;
                Ok(format!("updated to {new_version}"))
            }
            Err(e) => {
                error!(deployment_id = %id, error = %e, "update failed");
                deployment.status = DeploymentStatus::Error;
                deployment.last_action = Some(format!("Update failed: {e}"));
                if let Err(save_err) = self.store.save(&deployment).await {
                    warn!(deployment_id = %id, error = %save_err, "failed to record failure");
                }
                Err(e)
            }
        }
    }

    async fn apply_update(&self, deployment: &Deployment, reset_db: bool) -> ControlResult<bool> {
        let id = &deployment.id;
        self.remove_conflicting_sources(id).await;
        self.fix_generated_ports(id).await;
        self.rewrite_manifest(deployment).await?;

        let orchestrator = self.orchestrator(id);
        orchestrator.stop().await?;

        self.prepopulate_sources(id).await;
        self.run_task(id, AGGREGATE_TASK, &[]).await?;
        let db_task = if reset_db { "resetdb" } else { "update" };
        self.run_task(id, db_task, &[]).await?;
        self.run_task(id, "start", &["--detach"]).await?;

        orchestrator.wait_healthy(None).await
    }

    /// Stop a deployment's containers, keeping record and port block.
    pub async fn stop(&self, id: &DeploymentId) -> ControlResult<()> {
        self.require(id).await?;
        info!(deployment_id = %id, "stopping deployment");
        self.orchestrator(id).stop().await?;
        self.store
            .update_status(id, DeploymentStatus::Stopped, Some("Stopped"))
            .await
    }

    /// Start a stopped deployment and wait for health.
    pub async fn start(&self, id: &DeploymentId) -> ControlResult<()> {
        let deployment = self.require(id).await?;
        if deployment.status != DeploymentStatus::Stopped {
            return Err(ControlError::InvalidStatus {
                operation: "start",
                required: DeploymentStatus::Stopped.as_str(),
                actual: deployment.status.as_str(),
            });
        }

        info!(deployment_id = %id, "starting deployment");
        let orchestrator = self.orchestrator(id);
        orchestrator.up().await?;

        let healthy = orchestrator.wait_healthy(None).await?;
        if healthy {
            self.store
                .update_status(id, DeploymentStatus::Running, Some("Started"))
                .await
        } else {
            self.store
                .update_status(
                    id,
                    DeploymentStatus::Error,
                    Some("Services failed to start"),
                )
                .await
        }
    }

    /// Restart a deployment; `quick` restarts containers in place, otherwise
    /// a full stop/start cycle runs.
    pub async fn restart(&self, id: &DeploymentId, quick: bool) -> ControlResult<()> {
        let deployment = self.require(id).await?;
        info!(deployment_id = %id, quick, "restarting deployment");

        let orchestrator = self.orchestrator(id);
        if quick {
            orchestrator.restart(None).await?;
        } else {
            orchestrator.stop().await?;
            orchestrator.up().await?;
        }
        self.store
            .update_status(id, deployment.status, Some("Restarted"))
            .await
    }

    /// Delete a deployment completely: containers and volumes, proxy
    /// config, working directory, store record (freeing the port block).
    /// Idempotent with respect to already-missing state.
    pub async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        if self.store.get(id).await?.is_none() {
            debug!(deployment_id = %id, "delete of unknown deployment is a no-op");
            return Ok(());
        }

        info!(deployment_id = %id, "deleting deployment");
        if self.compose_dir(id).exists() {
            if let Err(e) = self.orchestrator(id).down(true).await {
                warn!(deployment_id = %id, error = %e, "container teardown failed");
            }
        }
        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy.cleanup_domain(id.as_str()).await {
                warn!(deployment_id = %id, error = %e, "proxy cleanup failed");
            }
        }
        self.remove_dir(id).await;

        match self.store.delete(id).await {
            Ok(()) | Err(ControlError::NotFound(_)) => {
                info!(deployment_id = %id, "deployment deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drift-correction sweep: inspect actual container state for every
    /// known deployment and correct the persisted status where it disagrees.
    pub async fn sync_states(&self) -> ControlResult<SyncReport> {
        let deployments = self.store.list(&DeploymentFilter::new()).await?;
        info!(count = deployments.len(), "syncing deployment states");

        let mut report = SyncReport::default();
        for deployment in deployments {
            report.checked += 1;
            let id = &deployment.id;

            let containers = match self.orchestrator(id).status().await {
                Ok(containers) => containers,
                Err(e) => {
                    report.errors.push(format!("{id}: {e}"));
                    continue;
                }
            };

            let correction = if containers.is_empty() {
                (deployment.status == DeploymentStatus::Running)
                    .then_some((DeploymentStatus::Stopped, "Containers not found"))
            } else {
                let app_running = containers
                    .iter()
                    .any(|(name, s)| name.contains("odoo") && s.state == "running");
                if app_running && deployment.status != DeploymentStatus::Running {
                    Some((DeploymentStatus::Running, "State synced - running"))
                } else if !app_running && deployment.status == DeploymentStatus::Running {
                    Some((DeploymentStatus::Stopped, "State synced - stopped"))
                } else {
                    None
                }
            };

            if let Some((status, action)) = correction {
                info!(deployment_id = %id, from = %deployment.status, to = %status, "correcting drifted status");
                match self.store.update_status(id, status, Some(action)).await {
                    Ok(()) => report.updated += 1,
                    Err(e) => report.errors.push(format!("{id}: {e}")),
                }
            }
        }
        Ok(report)
    }

    /// Persisted record plus live container status and stats.
    pub async fn status(&self, id: &DeploymentId) -> ControlResult<DeploymentDetail> {
        let deployment = self.require(id).await?;
        let orchestrator = self.orchestrator(id);
        let containers = orchestrator.status().await.unwrap_or_default();
        let stats = orchestrator.stats().await.unwrap_or_default();
        Ok(DeploymentDetail {
            deployment,
            containers,
            stats,
        })
    }

    /// Recent service logs.
    pub async fn logs(
        &self,
        id: &DeploymentId,
        service: Option<&str>,
        tail: u32,
    ) -> ControlResult<String> {
        self.require(id).await?;
        self.orchestrator(id).logs(service, tail).await
    }

    /// Run an arbitrary task-runner task against a deployment's tree.
    pub async fn execute_task(
        &self,
        id: &DeploymentId,
        task: &str,
        extra: &[&str],
    ) -> ControlResult<String> {
        self.require(id).await?;
        let output = self.run_task(id, task, extra).await?;
        self.store
            .update_status(
                id,
                self.require(id).await?.status,
                Some(&format!("Executed {task}")),
            )
            .await?;
        Ok(output)
    }

    /// Deployment counts by status.
    pub async fn metrics(&self) -> ControlResult<DeploymentMetrics> {
        let deployments = self.store.list(&DeploymentFilter::new()).await?;
        let mut metrics = DeploymentMetrics::default();
        for deployment in &deployments {
            metrics.total += 1;
            match deployment.status {
                DeploymentStatus::Creating => metrics.creating += 1,
                DeploymentStatus::Running => metrics.running += 1,
                DeploymentStatus::Stopped => metrics.stopped += 1,
                DeploymentStatus::Error => metrics.error += 1,
                DeploymentStatus::Updating => metrics.updating += 1,
            }
        }
        Ok(metrics)
    }

    async fn require(&self, id: &DeploymentId) -> ControlResult<Deployment> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }
}

fn emit(progress: Option<&ProgressSender>, phase: &str, detail: &str) {
    if let Some(sender) = progress {
        let _ = sender.send(PhaseEvent {
            phase: phase.to_owned(),
            detail: detail.to_owned(),
        });
    }
}

/// Collect every parameter violation; an empty vector means valid.
#[must_use]
pub fn validate(params: &CreateParams) -> Vec<String> {
    let mut violations = Vec::new();
    if !valid_deployment_name(&params.name) {
        violations.push(format!(
            "invalid name {:?}: 3-20 characters, lowercase alphanumeric and hyphens, \
             no leading or trailing hyphen",
            params.name
        ));
    }
    if !valid_email(&params.tester_email) {
        violations.push(format!("invalid email {:?}", params.tester_email));
    }
    if params.primary_version.trim().is_empty() {
        violations.push("primary version must not be empty".to_owned());
    }
    violations
}

/// Generate a 16-character alphanumeric basic-auth password.
#[must_use]
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
