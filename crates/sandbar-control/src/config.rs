//! Configuration for the sandbar control service.
//!
//! Loaded from `sandbar.toml` merged with `SANDBAR_`-prefixed environment
//! variables (`__` separates nesting levels, e.g. `SANDBAR_PORTS__RANGE_START`).

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Store settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Filesystem layout.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Port allocator settings.
    #[serde(default)]
    pub ports: PortsConfig,
    /// Git mirror cache settings.
    #[serde(default)]
    pub git: GitConfig,
    /// Container orchestration settings.
    #[serde(default)]
    pub compose: ComposeConfig,
    /// Reverse proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Deployment policy settings.
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

impl ControlConfig {
    /// Load configuration from `sandbar.toml` and the environment.
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("sandbar.toml"))
            .merge(Env::prefixed("SANDBAR_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8090".to_owned()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://sandbar.db?mode=rwc".to_owned()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one working tree per deployment.
    #[serde(default = "default_deployments_dir")]
    pub deployments_dir: String,
    /// Directory holding git mirrors.
    #[serde(default = "default_git_cache_dir")]
    pub git_cache_dir: String,
}

fn default_deployments_dir() -> String {
    "/srv/sandbar/deployments".to_owned()
}

fn default_git_cache_dir() -> String {
    "/srv/sandbar/git-cache".to_owned()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            deployments_dir: default_deployments_dir(),
            git_cache_dir: default_git_cache_dir(),
        }
    }
}

/// Port allocator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    /// Start of the allocatable range (inclusive).
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    /// End of the allocatable range (exclusive).
    #[serde(default = "default_range_end")]
    pub range_end: u16,
    /// Width of the block each deployment owns.
    #[serde(default = "default_increment")]
    pub increment: u16,
}

const fn default_range_start() -> u16 {
    18000
}

const fn default_range_end() -> u16 {
    19000
}

const fn default_increment() -> u16 {
    100
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
            increment: default_increment(),
        }
    }
}

/// Git mirror cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Freshness window in seconds; fetches and ref listings inside the
    /// window reuse cached state.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Repository URLs mirrored shallow to bound disk use.
    #[serde(default = "default_shallow_repos")]
    pub shallow_repos: Vec<String>,
    /// Clone/fetch depth for shallow mirrors.
    #[serde(default = "default_shallow_depth")]
    pub shallow_depth: u32,
    /// Primary source repository cloned into every deployment.
    #[serde(default = "default_primary_repo")]
    pub primary_repo: String,
    /// Repository whose branches and tags form the selectable version list.
    #[serde(default = "default_modules_repo")]
    pub modules_repo: String,
    /// Bound on concurrent per-repository version listings.
    #[serde(default = "default_version_concurrency")]
    pub version_concurrency: usize,
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_shallow_repos() -> Vec<String> {
    vec!["https://github.com/odoo/odoo.git".to_owned()]
}

const fn default_shallow_depth() -> u32 {
    1
}

fn default_primary_repo() -> String {
    "https://github.com/OpenSPP/openspp-docker.git".to_owned()
}

fn default_modules_repo() -> String {
    "https://github.com/openspp/openspp-modules.git".to_owned()
}

const fn default_version_concurrency() -> usize {
    6
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            shallow_repos: default_shallow_repos(),
            shallow_depth: default_shallow_depth(),
            primary_repo: default_primary_repo(),
            modules_repo: default_modules_repo(),
            version_concurrency: default_version_concurrency(),
        }
    }
}

/// Container orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Prefix for compose project names.
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,
    /// Services whose running+healthy state gates the health wait.
    #[serde(default = "default_critical_services")]
    pub critical_services: Vec<String>,
    /// Service name fragments excluded from the health gate.
    #[serde(default = "default_proxy_services")]
    pub proxy_services: Vec<String>,
    /// Seconds between health polls.
    #[serde(default = "default_health_poll_secs")]
    pub health_poll_secs: u64,
    /// Health wait timeout in seconds.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    /// Bound on concurrent per-container stats calls.
    #[serde(default = "default_stats_concurrency")]
    pub stats_concurrency: usize,
}

fn default_project_prefix() -> String {
    "openspp_".to_owned()
}

fn default_critical_services() -> Vec<String> {
    vec!["odoo".to_owned(), "db".to_owned()]
}

fn default_proxy_services() -> Vec<String> {
    vec!["proxy".to_owned()]
}

const fn default_health_poll_secs() -> u64 {
    5
}

const fn default_health_timeout_secs() -> u64 {
    300
}

const fn default_stats_concurrency() -> usize {
    8
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            project_prefix: default_project_prefix(),
            critical_services: default_critical_services(),
            proxy_services: default_proxy_services(),
            health_poll_secs: default_health_poll_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            stats_concurrency: default_stats_concurrency(),
        }
    }
}

/// Reverse proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Whether proxy-based routing is managed at all.
    #[serde(default)]
    pub enabled: bool,
    /// Directory for per-deployment config files.
    #[serde(default = "default_sites_available")]
    pub sites_available: String,
    /// Directory for enabled-site symlinks.
    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: String,
    /// Directory for per-deployment basic-auth credential files.
    #[serde(default = "default_htpasswd_dir")]
    pub htpasswd_dir: String,
    /// Global nginx configuration file (touched only by the auto-heal).
    #[serde(default = "default_nginx_conf")]
    pub nginx_conf: String,
    /// Base domain; deployments are routed as `<subdomain>.<base_domain>`.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
}

fn default_sites_available() -> String {
    "/etc/nginx/sites-available".to_owned()
}

fn default_sites_enabled() -> String {
    "/etc/nginx/sites-enabled".to_owned()
}

fn default_htpasswd_dir() -> String {
    "/etc/nginx/htpasswd".to_owned()
}

fn default_nginx_conf() -> String {
    "/etc/nginx/nginx.conf".to_owned()
}

fn default_base_domain() -> String {
    "test.openspp.org".to_owned()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
            htpasswd_dir: default_htpasswd_dir(),
            nginx_conf: default_nginx_conf(),
            base_domain: default_base_domain(),
        }
    }
}

/// Deployment policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Maximum deployments a single tester may own.
    #[serde(default = "default_max_per_tester")]
    pub max_per_tester: u32,
    /// Keep files and logs of failed deployments for inspection; only the
    /// containers are stopped.
    #[serde(default)]
    pub preserve_failed: bool,
    /// Skip the post-start health wait.
    #[serde(default)]
    pub skip_health_check: bool,
    /// CPU limit passed into generated environment files.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
    /// Memory limit passed into generated environment files.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// Retry attempts for transient external-tool failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Initial retry delay in seconds (doubles per attempt).
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

const fn default_max_per_tester() -> u32 {
    3
}

fn default_cpu_limit() -> String {
    "2".to_owned()
}

fn default_memory_limit() -> String {
    "4GB".to_owned()
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_delay_secs() -> u64 {
    2
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            max_per_tester: default_max_per_tester(),
            preserve_failed: false,
            skip_health_check: false,
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ControlConfig::default();
        assert_eq!(config.ports.range_start, 18000);
        assert_eq!(config.ports.range_end, 19000);
        assert_eq!(config.ports.increment, 100);
        assert_eq!(config.git.cache_ttl_secs, 300);
        assert_eq!(config.compose.stats_concurrency, 8);
        assert_eq!(config.deployment.max_per_tester, 3);
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn config_from_toml() {
        let config: ControlConfig = toml::from_str(
            r#"
            [server]
            listen_addr = "0.0.0.0:9000"

            [ports]
            range_start = 20000
            range_end = 21000

            [compose]
            critical_services = ["app", "db"]

            [deployment]
            max_per_tester = 5
            preserve_failed = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.ports.range_start, 20000);
        assert_eq!(config.ports.increment, 100);
        assert_eq!(config.compose.critical_services, vec!["app", "db"]);
        assert_eq!(config.deployment.max_per_tester, 5);
        assert!(config.deployment.preserve_failed);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let config: ControlConfig = toml::from_str(
            r#"
            [git]
            cache_ttl_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.git.cache_ttl_secs, 60);
        assert_eq!(config.git.shallow_depth, 1);
        assert_eq!(config.database.max_connections, 5);
    }
}
