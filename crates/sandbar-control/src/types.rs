//! Core types for sandbar-control.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9-]{1,18}[a-z0-9]$").unwrap_or_else(|e| panic!("name regex: {e}"))
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .unwrap_or_else(|e| panic!("email regex: {e}"))
});

/// Validates a deployment name: lowercase alphanumeric and hyphens, 3-20
/// characters, no leading or trailing hyphen.
#[must_use]
pub fn valid_deployment_name(name: &str) -> bool {
    NAME_RE.is_match(&name.to_lowercase())
}

/// Validates a tester email address.
#[must_use]
pub fn valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Unique identifier for a deployment.
///
/// Derived from the tester's email local part plus the deployment name,
/// e.g. `a@x.com` + `app1` -> `a-app1`. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Wrap an existing ID string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the canonical ID from a tester email and deployment name.
    ///
    /// The email local part is lowercased with dots mapped to hyphens; any
    /// remaining character outside `[a-z0-9-]` is dropped from both parts.
    #[must_use]
    pub fn derive(tester_email: &str, name: &str) -> Self {
        let local = tester_email.split('@').next().unwrap_or(tester_email);
        let tester: String = local
            .to_lowercase()
            .replace('.', "-")
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
            .collect();
        let name: String = name
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
            .collect();
        Self(format!("{tester}-{name}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Database name for this deployment (hyphens are not valid in
    /// PostgreSQL identifiers).
    #[must_use]
    pub fn db_name(&self) -> String {
        self.0.replace('-', "_")
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deployment lifecycle status as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Bring-up sequence in progress.
    Creating,
    /// Containers up and critical services healthy.
    Running,
    /// Containers stopped, record and port block retained.
    Stopped,
    /// A create or update phase failed; see `last_action`.
    Error,
    /// Version update in progress.
    Updating,
}

impl DeploymentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Updating => "updating",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "updating" => Ok(Self::Updating),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Environment profile a deployment runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Development profile with debug tooling enabled.
    Devel,
    /// Test profile.
    Test,
    /// Production-like profile.
    Prod,
}

impl Environment {
    /// Get the environment name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Devel => "devel",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "devel" => Ok(Self::Devel),
            "test" => Ok(Self::Test),
            "prod" => Ok(Self::Prod),
            _ => Err(format!("unknown environment: {s}")),
        }
    }
}

/// Fixed port offsets from a deployment's port base, one per exposed
/// service. The set is closed: service ports are never chosen
/// independently of the base.
pub const SERVICE_PORT_OFFSETS: &[(&str, u16)] = &[
    ("odoo", 0),
    ("smtp", 25),
    ("db", 32),
    ("longpolling", 72),
    ("pgweb", 81),
    ("debugger", 84),
    ("proxy", 99),
];

/// Derive the full service -> port map from a port base.
#[must_use]
pub fn port_mappings(port_base: u16) -> BTreeMap<String, u16> {
    SERVICE_PORT_OFFSETS
        .iter()
        .map(|(service, offset)| ((*service).to_owned(), port_base + offset))
        .collect()
}

/// A tenant's test environment, as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique identifier derived from tester + name.
    pub id: DeploymentId,
    /// Deployment name chosen by the tester.
    pub name: String,
    /// Owning tester's email address.
    pub tester_email: String,
    /// Branch or tag of the primary source repository.
    pub primary_version: String,
    /// Per-dependency version overrides, keyed by dependency name.
    pub dependency_versions: BTreeMap<String, String>,
    /// Environment profile.
    pub environment: Environment,
    /// Current lifecycle status.
    pub status: DeploymentStatus,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub last_updated: DateTime<Utc>,
    /// Base of the owned port block; 0 until allocated.
    pub port_base: u16,
    /// Subdomain used for proxy routing.
    pub subdomain: String,
    /// Modules installed during bring-up.
    pub modules_installed: Vec<String>,
    /// Diagnostic for the most recent action or failure.
    pub last_action: Option<String>,
    /// Free-text notes.
    pub notes: Option<String>,
    /// Generated secret for proxy basic-auth (username = id).
    pub auth_password: String,
}

impl Deployment {
    /// Create a new deployment record in the creating state.
    #[must_use]
    pub fn new(
        name: String,
        tester_email: String,
        primary_version: String,
        dependency_versions: BTreeMap<String, String>,
        environment: Environment,
        auth_password: String,
    ) -> Self {
        let id = DeploymentId::derive(&tester_email, &name);
        let subdomain = id.as_str().to_owned();
        let now = Utc::now();
        Self {
            id,
            name,
            tester_email,
            primary_version,
            dependency_versions,
            environment,
            status: DeploymentStatus::Creating,
            created_at: now,
            last_updated: now,
            port_base: 0,
            subdomain,
            modules_installed: Vec::new(),
            last_action: None,
            notes: None,
            auth_password,
        }
    }

    /// Derived service -> port map for this deployment.
    #[must_use]
    pub fn port_mappings(&self) -> BTreeMap<String, u16> {
        port_mappings(self.port_base)
    }
}

/// A port block bound to one deployment until that deployment is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    /// Base of the allocated block.
    pub port_base: u16,
    /// Owning deployment.
    pub deployment_id: DeploymentId,
    /// When the block was allocated.
    pub allocated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn id_derivation() {
        assert_eq!(DeploymentId::derive("a@x.com", "app1").as_str(), "a-app1");
        assert_eq!(
            DeploymentId::derive("John.Doe@example.org", "Demo-Env").as_str(),
            "john-doe-demo-env"
        );
        assert_eq!(
            DeploymentId::derive("user+test@x.com", "app").as_str(),
            "usertest-app"
        );
    }

    #[test]
    fn db_name_replaces_hyphens() {
        assert_eq!(DeploymentId::new("a-app1").db_name(), "a_app1");
    }

    #[test]
    fn name_validation() {
        assert!(valid_deployment_name("app1"));
        assert!(valid_deployment_name("my-env-2"));
        assert!(!valid_deployment_name("ab"));
        assert!(!valid_deployment_name("-leading"));
        assert!(!valid_deployment_name("trailing-"));
        assert!(!valid_deployment_name("way-too-long-name-over-twenty"));
        assert!(!valid_deployment_name("bad_chars"));
    }

    #[test]
    fn email_validation() {
        assert!(valid_email("a@x.com"));
        assert!(valid_email("john.doe+test@example.co.uk"));
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing@tld"));
    }

    #[test]
    fn status_round_trip() {
        for status in [
            DeploymentStatus::Creating,
            DeploymentStatus::Running,
            DeploymentStatus::Stopped,
            DeploymentStatus::Error,
            DeploymentStatus::Updating,
        ] {
            assert_eq!(DeploymentStatus::from_str(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(DeploymentStatus::from_str("zombie").is_err());
        assert!(DeploymentStatus::from_str("").is_err());
    }

    #[test]
    fn port_mappings_are_fixed_offsets() {
        let ports = port_mappings(18000);
        assert_eq!(ports["odoo"], 18000);
        assert_eq!(ports["smtp"], 18025);
        assert_eq!(ports["db"], 18032);
        assert_eq!(ports["longpolling"], 18072);
        assert_eq!(ports["pgweb"], 18081);
        assert_eq!(ports["debugger"], 18084);
        assert_eq!(ports["proxy"], 18099);
    }
}
