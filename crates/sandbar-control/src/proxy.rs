//! Reverse-proxy (nginx) virtual-host reconciliation.
//!
//! Each live deployment owns one config file in sites-available, a symlink
//! in sites-enabled and an htpasswd file. The reconciler diffs that on-disk
//! set against the live deployment set, heals a known global misconfiguration
//! (`server_names_hash_bucket_size`) and rolls back a freshly written config
//! if the proxy refuses to reload with it.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ControlError, ControlResult};
use crate::process::{Cmd, CommandRunner};
use crate::types::Deployment;

const CONFIG_PREFIX: &str = "openspp-";
const MIN_BUCKET_SIZE: u32 = 128;

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Deployments examined.
    pub checked: u32,
    /// Config files created for deployments that were missing one.
    pub created: u32,
    /// Credential files recreated for deployments that had lost theirs.
    pub updated: u32,
    /// Stale config files removed.
    pub removed: u32,
    /// Per-item failures; one item's failure never aborts the sweep.
    pub errors: Vec<String>,
}

/// Proxy daemon status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    /// Whether the daemon is running.
    pub running: bool,
    /// Whether the full configuration currently validates.
    pub config_valid: bool,
    /// When the last reload was attempted.
    pub last_reload_time: Option<DateTime<Utc>>,
    /// Whether the last reload succeeded.
    pub last_reload_ok: Option<bool>,
    /// Error from the last failed reload.
    pub last_reload_error: Option<String>,
}

#[derive(Debug, Default)]
struct ReloadState {
    time: Option<DateTime<Utc>>,
    ok: Option<bool>,
    error: Option<String>,
}

/// Manages per-deployment nginx virtual hosts and basic-auth credentials.
#[derive(Debug)]
pub struct ProxyReconciler {
    config: ProxyConfig,
    runner: CommandRunner,
    last_reload: Mutex<ReloadState>,
}

impl ProxyReconciler {
    /// Create a reconciler over the configured nginx layout.
    #[must_use]
    pub fn new(config: ProxyConfig, runner: CommandRunner) -> Self {
        Self {
            config,
            runner,
            last_reload: Mutex::new(ReloadState::default()),
        }
    }

    fn config_path(&self, deployment_id: &str) -> PathBuf {
        PathBuf::from(&self.config.sites_available).join(config_filename(deployment_id))
    }

    fn enabled_path(&self, deployment_id: &str) -> PathBuf {
        PathBuf::from(&self.config.sites_enabled).join(config_filename(deployment_id))
    }

    fn htpasswd_path(&self, deployment_id: &str) -> PathBuf {
        PathBuf::from(&self.config.htpasswd_dir).join(format!("htpasswd-{deployment_id}"))
    }

    /// Render the full virtual-host configuration for one deployment: an
    /// unauthenticated internal vhost and a basic-auth external vhost for
    /// the application, plus internal/external pairs for the mail-capture
    /// and DB web UI services.
    #[must_use]
    pub fn generate_config(&self, deployment: &Deployment) -> String {
        let id = deployment.id.as_str();
        let external = format!("{}.{}", deployment.subdomain, self.config.base_domain);
        let internal = format!("{id}.internal.{}", self.config.base_domain);
        let ports = deployment.port_mappings();
        let odoo = ports["odoo"];
        let longpolling = ports["longpolling"];
        let smtp = ports["smtp"];
        let pgweb = ports["pgweb"];
        let htpasswd = self.htpasswd_path(id).display().to_string();

        format!(
            r#"# Managed by sandbar-control for deployment {id}
# Ports: odoo={odoo}, smtp={smtp}, pgweb={pgweb}

# Internal access, no authentication
server {{
    listen 80;
    server_name {internal};

    location / {{
        proxy_pass http://localhost:{odoo};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    }}

    location /longpolling {{
        proxy_pass http://localhost:{longpolling};
    }}
}}

# External access, basic auth
server {{
    listen 80;
    server_name {external};

    auth_basic "Deployment {id}";
    auth_basic_user_file {htpasswd};

    location / {{
        proxy_pass http://localhost:{odoo};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    }}

    location /longpolling {{
        proxy_pass http://localhost:{longpolling};
    }}
}}

# Mail capture UI
server {{
    listen 80;
    server_name mailhog-{internal};

    location / {{
        proxy_pass http://localhost:{smtp};
    }}
}}

server {{
    listen 80;
    server_name mailhog-{external};

    auth_basic "Mailhog {id}";
    auth_basic_user_file {htpasswd};

    location / {{
        proxy_pass http://localhost:{smtp};
    }}
}}

# DB web UI
server {{
    listen 80;
    server_name pgweb-{internal};

    location / {{
        proxy_pass http://localhost:{pgweb};
    }}
}}

server {{
    listen 80;
    server_name pgweb-{external};

    auth_basic "PGWeb {id}";
    auth_basic_user_file {htpasswd};

    location / {{
        proxy_pass http://localhost:{pgweb};
    }}
}}
"#
        )
    }

    async fn write_htpasswd(&self, deployment: &Deployment) -> ControlResult<()> {
        let path = self.htpasswd_path(deployment.id.as_str());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entry = htpasswd_entry(deployment.id.as_str(), &deployment.auth_password);
        tokio::fs::write(&path, entry).await?;
        debug!(deployment_id = %deployment.id, path = %path.display(), "wrote htpasswd file");
        Ok(())
    }

    async fn write_and_enable(&self, deployment: &Deployment) -> ControlResult<()> {
        let content = self.generate_config(deployment);
        let config_path = self.config_path(deployment.id.as_str());
        let enabled_path = self.enabled_path(deployment.id.as_str());

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = enabled_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&config_path, content).await?;
        match tokio::fs::remove_file(&enabled_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::symlink(&config_path, &enabled_path).await?;
        info!(deployment_id = %deployment.id, "saved and enabled proxy config");
        Ok(())
    }

    async fn remove_config_files(&self, deployment_id: &str) -> ControlResult<()> {
        for path in [
            self.enabled_path(deployment_id),
            self.config_path(deployment_id),
            self.htpasswd_path(deployment_id),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed proxy file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn validate(&self) -> ControlResult<()> {
        self.runner
            .run(&Cmd::new("nginx").args(["-t"]))
            .await
            .map(|_| ())
            .map_err(|e| ControlError::Proxy(e.stderr.trim().to_owned()))
    }

    async fn reload(&self) -> ControlResult<()> {
        let systemctl = self
            .runner
            .run(&Cmd::new("systemctl").args(["reload", "nginx"]))
            .await;
        if systemctl.is_ok() {
            return Ok(());
        }
        self.runner
            .run(&Cmd::new("nginx").args(["-s", "reload"]))
            .await
            .map(|_| ())
            .map_err(|e| ControlError::Proxy(format!("reload failed: {}", e.stderr.trim())))
    }

    fn record_reload(&self, result: &ControlResult<()>) {
        if let Ok(mut state) = self.last_reload.lock() {
            state.time = Some(Utc::now());
            state.ok = Some(result.is_ok());
            state.error = result.as_ref().err().map(ToString::to_string);
        }
    }

    /// Validate the full configuration and reload the daemon, auto-healing
    /// a hash-bucket-size failure once by doubling the global setting.
    async fn validate_and_reload(&self) -> ControlResult<()> {
        if let Err(e) = self.validate().await {
            if e.to_string().contains("server_names_hash_bucket_size") {
                info!("hash bucket size validation failure, attempting auto-heal");
                self.grow_bucket_size().await?;
                self.validate().await?;
            } else {
                return Err(e);
            }
        }

        let result = self.reload().await;
        self.record_reload(&result);
        result
    }

    async fn grow_bucket_size(&self) -> ControlResult<()> {
        let conf_path = PathBuf::from(&self.config.nginx_conf);
        let conf = tokio::fs::read_to_string(&conf_path).await?;
        let (updated, new_size) = bump_bucket_size(&conf);
        tokio::fs::write(&conf_path, updated).await?;
        info!(new_size, "updated server_names_hash_bucket_size");
        Ok(())
    }

    /// Set up routing for one deployment: credentials, config, enable,
    /// validate, reload. A config that fails validation or reload is rolled
    /// back so the proxy never keeps pointing at a broken site.
    pub async fn setup_domain(&self, deployment: &Deployment) -> ControlResult<String> {
        info!(deployment_id = %deployment.id, "setting up proxy domain");

        let mut warnings = Vec::new();
        if deployment.auth_password.is_empty() {
            warn!(deployment_id = %deployment.id, "no auth password set, skipping htpasswd");
            warnings.push("no authentication password set".to_owned());
        } else {
            self.write_htpasswd(deployment).await?;
        }

        self.write_and_enable(deployment).await?;

        if let Err(e) = self.validate_and_reload().await {
            self.remove_config_files(deployment.id.as_str()).await?;
            return Err(ControlError::Proxy(format!(
                "config invalid, rolled back: {e}"
            )));
        }

        if warnings.is_empty() {
            Ok("domain configured".to_owned())
        } else {
            Ok(format!("domain configured with warnings: {}", warnings.join("; ")))
        }
    }

    /// Remove a deployment's config, enabled-site symlink and credential
    /// file, then reload. Reload failure is reported in the message but the
    /// removal is not reverted.
    pub async fn cleanup_domain(&self, deployment_id: &str) -> ControlResult<String> {
        info!(deployment_id, "removing proxy domain");
        self.remove_config_files(deployment_id).await?;

        match self.validate_and_reload().await {
            Ok(()) => Ok("domain removed".to_owned()),
            Err(e) => Ok(format!("domain removed, reload failed: {e}")),
        }
    }

    /// Diff the on-disk config set against the live deployment set: create
    /// configs for deployments missing one, remove configs whose deployment
    /// no longer exists, and recreate missing credential files. Per-item
    /// errors are collected, never fatal to the rest of the sweep.
    pub async fn reconcile(&self, deployments: &[Deployment]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let existing = match self.existing_config_ids().await {
            Ok(existing) => existing,
            Err(e) => {
                report.errors.push(format!("listing configs: {e}"));
                return report;
            }
        };

        let mut changed = false;
        let live: BTreeSet<String> = deployments
            .iter()
            .map(|d| d.id.as_str().to_owned())
            .collect();

        for deployment in deployments {
            report.checked += 1;
            if !existing.contains(deployment.id.as_str()) {
                info!(deployment_id = %deployment.id, "creating missing proxy config");
                match self.write_and_enable(deployment).await {
                    Ok(()) => {
                        report.created += 1;
                        changed = true;
                    }
                    Err(e) => report.errors.push(format!("{}: {e}", deployment.id)),
                }
            }
        }

        for stale in existing.difference(&live) {
            info!(deployment_id = %stale, "removing stale proxy config");
            match self.remove_config_files(stale).await {
                Ok(()) => {
                    report.removed += 1;
                    changed = true;
                }
                Err(e) => report.errors.push(format!("{stale}: {e}")),
            }
        }

        for deployment in deployments {
            if deployment.auth_password.is_empty() {
                continue;
            }
            if !self.htpasswd_path(deployment.id.as_str()).exists() {
                info!(deployment_id = %deployment.id, "recreating missing htpasswd");
                match self.write_htpasswd(deployment).await {
                    Ok(()) => report.updated += 1,
                    Err(e) => report
                        .errors
                        .push(format!("{} htpasswd: {e}", deployment.id)),
                }
            }
        }

        if changed {
            if let Err(e) = self.validate_and_reload().await {
                report.errors.push(format!("reload: {e}"));
            }
        }

        report
    }

    async fn existing_config_ids(&self) -> ControlResult<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&self.config.sites_available).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = deployment_id_from_filename(&name) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    /// Report daemon liveness, config validity and last-reload outcome.
    pub async fn status(&self) -> ProxyStatus {
        let running = match self
            .runner
            .run(&Cmd::new("systemctl").args(["is-active", "nginx"]))
            .await
        {
            Ok(_) => true,
            Err(_) => self
                .runner
                .run(&Cmd::new("pgrep").args(["-x", "nginx"]))
                .await
                .is_ok(),
        };

        let config_valid = self.validate().await.is_ok();

        let (last_reload_time, last_reload_ok, last_reload_error) = self
            .last_reload
            .lock()
            .map(|state| (state.time, state.ok, state.error.clone()))
            .unwrap_or((None, None, None));

        ProxyStatus {
            running,
            config_valid,
            last_reload_time,
            last_reload_ok,
            last_reload_error,
        }
    }
}

/// Config file name for a deployment.
#[must_use]
pub fn config_filename(deployment_id: &str) -> String {
    format!("{CONFIG_PREFIX}{deployment_id}.conf")
}

/// Inverse of [`config_filename`]; `None` for files we do not manage.
#[must_use]
pub fn deployment_id_from_filename(name: &str) -> Option<String> {
    name.strip_prefix(CONFIG_PREFIX)?
        .strip_suffix(".conf")
        .map(ToOwned::to_owned)
}

/// Basic-auth credential line in the `{SHA}` scheme nginx accepts.
#[must_use]
pub fn htpasswd_entry(username: &str, password: &str) -> String {
    let digest = Sha1::digest(password.as_bytes());
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    format!("{username}:{{SHA}}{encoded}\n")
}

/// Double `server_names_hash_bucket_size` in a global nginx config (floor
/// 128), inserting the directive after `http {` when absent. Returns the
/// rewritten config and the new size.
#[must_use]
pub fn bump_bucket_size(conf: &str) -> (String, u32) {
    static BUCKET_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"server_names_hash_bucket_size\s+(\d+);").unwrap()
    });
    let directive_re = &*BUCKET_RE;

    if let Some(caps) = directive_re.captures(conf) {
        let current: u32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(MIN_BUCKET_SIZE);
        let new_size = (current * 2).max(MIN_BUCKET_SIZE);
        let updated = directive_re
            .replace(conf, format!("server_names_hash_bucket_size {new_size};"))
            .into_owned();
        (updated, new_size)
    } else if let Some(pos) = conf.find("http {") {
        let insert_at = pos + "http {".len();
        let mut updated = conf.to_owned();
        updated.insert_str(
            insert_at,
            &format!("\n    server_names_hash_bucket_size {MIN_BUCKET_SIZE};"),
        );
        (updated, MIN_BUCKET_SIZE)
    } else {
        (
            format!("server_names_hash_bucket_size {MIN_BUCKET_SIZE};\n{conf}"),
            MIN_BUCKET_SIZE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Deployment, Environment};
    use std::collections::BTreeMap;

    fn test_deployment() -> Deployment {
        let mut d = Deployment::new(
            "app1".to_owned(),
            "a@x.com".to_owned(),
            "17.0".to_owned(),
            BTreeMap::new(),
            Environment::Devel,
            "hunter2".to_owned(),
        );
        d.port_base = 18000;
        d
    }

    fn reconciler_in(dir: &std::path::Path) -> ProxyReconciler {
        let config = ProxyConfig {
            enabled: true,
            sites_available: dir.join("sites-available").display().to_string(),
            sites_enabled: dir.join("sites-enabled").display().to_string(),
            htpasswd_dir: dir.join("htpasswd").display().to_string(),
            nginx_conf: dir.join("nginx.conf").display().to_string(),
            base_domain: "test.openspp.org".to_owned(),
        };
        ProxyReconciler::new(config, CommandRunner::default())
    }

    #[test]
    fn filename_round_trip() {
        assert_eq!(config_filename("a-app1"), "openspp-a-app1.conf");
        assert_eq!(
            deployment_id_from_filename("openspp-a-app1.conf").as_deref(),
            Some("a-app1")
        );
        assert!(deployment_id_from_filename("default.conf").is_none());
        assert!(deployment_id_from_filename("openspp-a-app1.bak").is_none());
    }

    #[test]
    fn htpasswd_entry_uses_sha_scheme() {
        let entry = htpasswd_entry("a-app1", "hunter2");
        assert!(entry.starts_with("a-app1:{SHA}"));
        assert!(entry.ends_with('\n'));
        // SHA-1 digests encode to 28 base64 characters.
        let encoded = entry.trim_end().split("{SHA}").nth(1).unwrap();
        assert_eq!(encoded.len(), 28);
    }

    #[test]
    fn generated_config_covers_all_vhosts() {
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = reconciler_in(tmp.path());
        let config = reconciler.generate_config(&test_deployment());

        assert!(config.contains("server_name a-app1.test.openspp.org;"));
        assert!(config.contains("server_name a-app1.internal.test.openspp.org;"));
        assert!(config.contains("proxy_pass http://localhost:18000;"));
        assert!(config.contains("proxy_pass http://localhost:18072;"));
        assert!(config.contains("server_name mailhog-a-app1.test.openspp.org;"));
        assert!(config.contains("proxy_pass http://localhost:18025;"));
        assert!(config.contains("server_name pgweb-a-app1.test.openspp.org;"));
        assert!(config.contains("proxy_pass http://localhost:18081;"));
        assert!(config.contains("auth_basic_user_file"));
        assert!(config.contains("htpasswd-a-app1"));

        // The external app vhost is auth-protected, the internal one is not.
        let internal_block = config
            .split("# External access")
            .next()
            .unwrap()
            .split("# Internal access")
            .nth(1)
            .unwrap();
        assert!(!internal_block.contains("auth_basic "));
    }

    #[test]
    fn bucket_size_doubles_with_floor() {
        let (updated, size) = bump_bucket_size("http {\n    server_names_hash_bucket_size 64;\n}");
        assert_eq!(size, 128);
        assert!(updated.contains("server_names_hash_bucket_size 128;"));

        let (updated, size) = bump_bucket_size("http {\n    server_names_hash_bucket_size 128;\n}");
        assert_eq!(size, 256);
        assert!(updated.contains("server_names_hash_bucket_size 256;"));
    }

    #[test]
    fn bucket_size_inserted_when_missing() {
        let (updated, size) = bump_bucket_size("http {\n    include mime.types;\n}");
        assert_eq!(size, 128);
        assert!(updated.contains("http {\n    server_names_hash_bucket_size 128;"));
    }

    #[tokio::test]
    async fn reconcile_creates_missing_and_removes_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = reconciler_in(tmp.path());
        let sites = tmp.path().join("sites-available");
        std::fs::create_dir_all(&sites).unwrap();

        // One stale config with no matching deployment.
        std::fs::write(sites.join("openspp-ghost-old.conf"), "# stale").unwrap();

        let deployment = test_deployment();
        let report = reconciler.reconcile(std::slice::from_ref(&deployment)).await;

        assert_eq!(report.checked, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.removed, 1);
        assert!(sites.join("openspp-a-app1.conf").exists());
        assert!(!sites.join("openspp-ghost-old.conf").exists());
        // htpasswd was missing and recreated.
        assert_eq!(report.updated, 1);
        assert!(tmp.path().join("htpasswd/htpasswd-a-app1").exists());
        // The reload itself fails in this environment and lands in errors;
        // the sweep still completed every item.
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_is_a_noop_when_in_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = reconciler_in(tmp.path());
        let deployment = test_deployment();

        let first = reconciler.reconcile(std::slice::from_ref(&deployment)).await;
        assert_eq!(first.created, 1);

        let second = reconciler.reconcile(std::slice::from_ref(&deployment)).await;
        assert_eq!(second.checked, 1);
        assert_eq!(second.created, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(second.updated, 0);
        assert!(second.errors.is_empty());
    }

    #[tokio::test]
    async fn cleanup_is_best_effort() {
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = reconciler_in(tmp.path());
        let deployment = test_deployment();

        reconciler.reconcile(std::slice::from_ref(&deployment)).await;
        assert!(tmp.path().join("sites-available/openspp-a-app1.conf").exists());

        let message = reconciler.cleanup_domain("a-app1").await.unwrap();
        assert!(message.starts_with("domain removed"));
        assert!(!tmp.path().join("sites-available/openspp-a-app1.conf").exists());
        assert!(!tmp.path().join("sites-enabled/openspp-a-app1.conf").exists());
        assert!(!tmp.path().join("htpasswd/htpasswd-a-app1").exists());

        // Cleaning an already-clean deployment is idempotent.
        reconciler.cleanup_domain("a-app1").await.unwrap();
    }
}
