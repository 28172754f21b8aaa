//! Container orchestration for one deployment's working tree.
//!
//! Wraps the compose tool and the container daemon CLI. Containers belonging
//! to a deployment are scoped by the compose project label; per-container
//! stats collection fans out over a bounded set of concurrent inspections
//! because each stats call is a blocking round-trip to the daemon.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ComposeConfig;
use crate::error::{ControlError, ControlResult};
use crate::process::{Cmd, CommandError, CommandRunner};
use crate::types::DeploymentId;

/// Compose project name for a deployment. The compose tool rejects hyphens
/// in project names.
#[must_use]
pub fn project_name(prefix: &str, id: &DeploymentId) -> String {
    format!("{prefix}{}", id.as_str().replace('-', "_"))
}

/// Observed state of one service's container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Container state (`running`, `exited`, ...).
    pub state: String,
    /// Health check status if the container defines one.
    pub health: Option<String>,
    /// Published port bindings.
    pub ports: Vec<String>,
    /// Container start time, as reported by the daemon.
    pub started_at: Option<String>,
}

impl ServiceStatus {
    fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Outcome tag for one service's stats sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsOutcome {
    /// Sample collected.
    Ok,
    /// Container reported unhealthy; sample skipped to avoid a hanging call.
    Unhealthy,
    /// Stats call failed for this container only.
    Error,
}

/// Resource usage sample for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    /// CPU usage percentage.
    pub cpu_percent: f64,
    /// Memory usage percentage.
    pub memory_percent: f64,
    /// Memory usage as reported (`used / limit`).
    pub memory_usage: String,
    /// Network I/O as reported (`rx / tx`).
    pub network_io: String,
    /// How this sample was obtained.
    pub outcome: StatsOutcome,
}

impl ServiceStats {
    fn zero(outcome: StatsOutcome) -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_usage: String::new(),
            network_io: String::new(),
            outcome,
        }
    }
}

/// Compose wrapper scoped to one deployment.
#[derive(Debug, Clone)]
pub struct ContainerOrchestrator {
    compose_dir: PathBuf,
    project: String,
    config: ComposeConfig,
    runner: CommandRunner,
}

impl ContainerOrchestrator {
    /// Create an orchestrator for the deployment's working tree.
    #[must_use]
    pub fn new(
        config: ComposeConfig,
        runner: CommandRunner,
        id: &DeploymentId,
        compose_dir: PathBuf,
    ) -> Self {
        Self {
            compose_dir,
            project: project_name(&config.project_prefix, id),
            config,
            runner,
        }
    }

    /// Compose project name used to scope containers.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    fn compose_cmd<I, S>(&self, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Cmd::new("docker")
            .arg("compose")
            .args(args)
            .current_dir(&self.compose_dir)
            .env("COMPOSE_PROJECT_NAME", &self.project)
    }

    async fn run_compose<I, S>(&self, args: I) -> ControlResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner
            .run(&self.compose_cmd(args))
            .await
            .map(|out| out.stdout)
            .map_err(container_error)
    }

    /// Bring the container group up, detached.
    pub async fn up(&self) -> ControlResult<()> {
        info!(project = %self.project, "starting containers");
        self.run_compose(["up", "-d"]).await?;
        Ok(())
    }

    /// Stop all containers without removing them.
    pub async fn stop(&self) -> ControlResult<()> {
        info!(project = %self.project, "stopping containers");
        self.run_compose(["stop"]).await?;
        Ok(())
    }

    /// Tear the container group down, optionally removing volumes.
    pub async fn down(&self, remove_volumes: bool) -> ControlResult<()> {
        info!(project = %self.project, remove_volumes, "tearing down containers");
        let mut args = vec!["down"];
        if remove_volumes {
            args.push("-v");
        }
        self.run_compose(args).await?;
        Ok(())
    }

    /// Restart every service, or one service if given.
    pub async fn restart(&self, service: Option<&str>) -> ControlResult<()> {
        let mut args = vec!["restart".to_owned()];
        if let Some(service) = service {
            args.push(service.to_owned());
        }
        self.run_compose(args).await?;
        Ok(())
    }

    /// Fetch recent log lines for the project or a single service.
    pub async fn logs(&self, service: Option<&str>, tail: u32) -> ControlResult<String> {
        let mut args = vec!["logs".to_owned(), "--tail".to_owned(), tail.to_string()];
        if let Some(service) = service {
            args.push(service.to_owned());
        }
        self.run_compose(args).await
    }

    /// Run a command inside a service container (no TTY).
    pub async fn exec(&self, service: &str, command: &[&str]) -> ControlResult<String> {
        let mut args = vec!["exec".to_owned(), "-T".to_owned(), service.to_owned()];
        args.extend(command.iter().map(|s| (*s).to_owned()));
        self.run_compose(args).await
    }

    async fn container_ids(&self) -> ControlResult<Vec<String>> {
        let label = format!("label=com.docker.compose.project={}", self.project);
        let out = self
            .runner
            .run(
                &Cmd::new("docker")
                    .args(["ps", "-aq", "--filter"])
                    .arg(label),
            )
            .await
            .map_err(container_error)?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    /// Describe every container in the project, keyed by service name.
    pub async fn status(&self) -> ControlResult<BTreeMap<String, ServiceStatus>> {
        let ids = self.container_ids().await?;
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let out = self
            .runner
            .run(&Cmd::new("docker").arg("inspect").args(ids))
            .await
            .map_err(container_error)?;
        let parsed: Value = serde_json::from_str(&out.stdout)?;

        let mut status = BTreeMap::new();
        for container in parsed.as_array().into_iter().flatten() {
            let (service, info) = parse_inspect(container);
            status.insert(service, info);
        }
        Ok(status)
    }

    /// Collect per-service resource usage, bounded-parallel across
    /// containers. A failed or unhealthy container degrades to a zero
    /// sample tagged with its outcome instead of failing the batch.
    pub async fn stats(&self) -> ControlResult<BTreeMap<String, ServiceStats>> {
        let status = self.status().await?;
        if status.is_empty() {
            return Ok(BTreeMap::new());
        }

        let samples = stream::iter(status.into_iter().map(|(service, info)| async move {
            if info.health.as_deref() == Some("unhealthy") {
                debug!(service, "skipping stats for unhealthy container");
                return (service, ServiceStats::zero(StatsOutcome::Unhealthy));
            }
            let stats = self.sample_stats(&service).await.unwrap_or_else(|e| {
                debug!(service, error = %e, "stats collection failed");
                ServiceStats::zero(StatsOutcome::Error)
            });
            (service, stats)
        }))
        .buffer_unordered(self.config.stats_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        Ok(samples.into_iter().collect())
    }

    async fn sample_stats(&self, service: &str) -> ControlResult<ServiceStats> {
        let label = format!(
            "label=com.docker.compose.project={},com.docker.compose.service={service}",
            self.project
        );
        let ids = self
            .runner
            .run(&Cmd::new("docker").args(["ps", "-q", "--filter"]).arg(label))
            .await
            .map_err(container_error)?;
        let id = ids
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ControlError::container(format!("no running container for {service}")))?
            .to_owned();

        let out = self
            .runner
            .run(
                &Cmd::new("docker")
                    .args(["stats", "--no-stream", "--format", "{{json .}}"])
                    .arg(id),
            )
            .await
            .map_err(container_error)?;
        let value: Value = serde_json::from_str(out.stdout.trim())?;
        Ok(parse_stats(&value))
    }

    /// Poll status until the critical services are running and healthy, or
    /// the timeout elapses. Returns whether the deployment became ready.
    pub async fn wait_healthy(&self, timeout: Option<Duration>) -> ControlResult<bool> {
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.health_timeout_secs));
        let poll = Duration::from_secs(self.config.health_poll_secs.max(1));
        let deadline = Instant::now() + timeout;

        let mut logged_services = false;
        loop {
            let status = match self.status().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(project = %self.project, error = %e, "status poll failed");
                    BTreeMap::new()
                }
            };

            if !logged_services && !status.is_empty() {
                info!(
                    project = %self.project,
                    services = ?status.keys().collect::<Vec<_>>(),
                    "found services"
                );
                logged_services = true;
            }

            if critical_ready(
                &status,
                &self.config.critical_services,
                &self.config.proxy_services,
            ) {
                info!(project = %self.project, "critical services are ready");
                return Ok(true);
            }

            if Instant::now() + poll > deadline {
                warn!(project = %self.project, "timeout waiting for services");
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Decide whether the critical-service gate passes for one status snapshot.
///
/// Every container must be running. Critical services must all be present
/// with health in {healthy, starting} or no health check at all. Services
/// matching a proxy fragment are exempt from the health gate entirely.
fn critical_ready(
    status: &BTreeMap<String, ServiceStatus>,
    critical: &[String],
    proxy_fragments: &[String],
) -> bool {
    if status.is_empty() {
        return false;
    }

    let mut critical_found = 0usize;
    for (service, info) in status {
        if !info.is_running() {
            return false;
        }

        if critical.contains(service) {
            critical_found += 1;
            if let Some(health) = &info.health {
                if health != "healthy" && health != "starting" {
                    return false;
                }
            }
        } else if proxy_fragments.iter().any(|frag| service.contains(frag)) {
            continue;
        }
    }

    critical_found == critical.len()
}

fn parse_inspect(container: &Value) -> (String, ServiceStatus) {
    let service = container
        .pointer("/Config/Labels/com.docker.compose.service")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();

    let ports = container
        .pointer("/NetworkSettings/Ports")
        .and_then(Value::as_object)
        .map(|ports| ports.keys().cloned().collect())
        .unwrap_or_default();

    let info = ServiceStatus {
        state: container
            .pointer("/State/Status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned(),
        health: container
            .pointer("/State/Health/Status")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        ports,
        started_at: container
            .pointer("/State/StartedAt")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
    };
    (service, info)
}

fn parse_stats(value: &Value) -> ServiceStats {
    let percent = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.trim_end_matches('%').parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };

    ServiceStats {
        cpu_percent: percent("CPUPerc"),
        memory_percent: percent("MemPerc"),
        memory_usage: text("MemUsage"),
        network_io: text("NetIO"),
        outcome: StatsOutcome::Ok,
    }
}

fn container_error(e: CommandError) -> ControlError {
    if e.transient {
        ControlError::Transient(e.to_string())
    } else {
        ControlError::Container(e.stderr.trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running(health: Option<&str>) -> ServiceStatus {
        ServiceStatus {
            state: "running".to_owned(),
            health: health.map(ToOwned::to_owned),
            ports: vec![],
            started_at: None,
        }
    }

    fn critical() -> Vec<String> {
        vec!["odoo".to_owned(), "db".to_owned()]
    }

    fn proxies() -> Vec<String> {
        vec!["proxy".to_owned()]
    }

    #[test]
    fn project_name_replaces_hyphens() {
        let id = DeploymentId::new("a-app1");
        assert_eq!(project_name("openspp_", &id), "openspp_a_app1");
    }

    #[test]
    fn gate_passes_when_critical_services_healthy() {
        let mut status = BTreeMap::new();
        status.insert("odoo".to_owned(), running(Some("healthy")));
        status.insert("db".to_owned(), running(None));
        assert!(critical_ready(&status, &critical(), &proxies()));
    }

    #[test]
    fn gate_accepts_starting_health() {
        let mut status = BTreeMap::new();
        status.insert("odoo".to_owned(), running(Some("starting")));
        status.insert("db".to_owned(), running(Some("healthy")));
        assert!(critical_ready(&status, &critical(), &proxies()));
    }

    #[test]
    fn gate_fails_on_unhealthy_critical_service() {
        let mut status = BTreeMap::new();
        status.insert("odoo".to_owned(), running(Some("unhealthy")));
        status.insert("db".to_owned(), running(None));
        assert!(!critical_ready(&status, &critical(), &proxies()));
    }

    #[test]
    fn gate_ignores_unhealthy_proxy_services() {
        let mut status = BTreeMap::new();
        status.insert("odoo".to_owned(), running(Some("healthy")));
        status.insert("db".to_owned(), running(None));
        status.insert("smtp_proxy".to_owned(), running(Some("unhealthy")));
        assert!(critical_ready(&status, &critical(), &proxies()));
    }

    #[test]
    fn gate_requires_all_critical_services_present() {
        let mut status = BTreeMap::new();
        status.insert("odoo".to_owned(), running(Some("healthy")));
        assert!(!critical_ready(&status, &critical(), &proxies()));
    }

    #[test]
    fn gate_fails_on_stopped_container() {
        let mut status = BTreeMap::new();
        status.insert("odoo".to_owned(), running(Some("healthy")));
        let mut db = running(None);
        db.state = "exited".to_owned();
        status.insert("db".to_owned(), db);
        assert!(!critical_ready(&status, &critical(), &proxies()));
    }

    #[test]
    fn gate_fails_on_empty_status() {
        assert!(!critical_ready(&BTreeMap::new(), &critical(), &proxies()));
    }

    #[test]
    fn inspect_parsing() {
        let container = json!({
            "Config": {
                "Labels": { "com.docker.compose.service": "odoo" }
            },
            "State": {
                "Status": "running",
                "StartedAt": "2025-08-01T12:00:00Z",
                "Health": { "Status": "healthy" }
            },
            "NetworkSettings": {
                "Ports": { "8069/tcp": [{ "HostPort": "18000" }] }
            }
        });
        let (service, info) = parse_inspect(&container);
        assert_eq!(service, "odoo");
        assert_eq!(info.state, "running");
        assert_eq!(info.health.as_deref(), Some("healthy"));
        assert_eq!(info.ports, vec!["8069/tcp"]);
    }

    #[test]
    fn inspect_parsing_without_health_check() {
        let container = json!({
            "Config": { "Labels": { "com.docker.compose.service": "db" } },
            "State": { "Status": "running" }
        });
        let (service, info) = parse_inspect(&container);
        assert_eq!(service, "db");
        assert!(info.health.is_none());
    }

    #[test]
    fn stats_parsing() {
        let value = json!({
            "CPUPerc": "12.34%",
            "MemPerc": "5.60%",
            "MemUsage": "230MiB / 4GiB",
            "NetIO": "1.2kB / 800B"
        });
        let stats = parse_stats(&value);
        assert!((stats.cpu_percent - 12.34).abs() < f64::EPSILON);
        assert!((stats.memory_percent - 5.6).abs() < f64::EPSILON);
        assert_eq!(stats.memory_usage, "230MiB / 4GiB");
        assert_eq!(stats.outcome, StatsOutcome::Ok);
    }

    #[test]
    fn stats_parsing_tolerates_missing_fields() {
        let stats = parse_stats(&json!({}));
        assert!((stats.cpu_percent).abs() < f64::EPSILON);
        assert_eq!(stats.memory_usage, "");
    }
}
