//! Version discovery for the primary module repository and its dependencies.
//!
//! Ref listings come from [`GitCacheManager`], which already caches them
//! under the configured freshness window, so this layer stays stateless.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use futures::stream::{self, StreamExt};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::GitConfig;
use crate::error::ControlResult;
use crate::gitcache::GitCacheManager;

/// Branch names that look like release tags but are long-lived branches.
const BRANCH_EXCEPTIONS: &[&str] = &["15.0", "17.0"];

/// Default branch pinned to the top of the version list when present.
const DEFAULT_BRANCH: &str = "17.0";

/// Lists selectable versions for deployments.
#[derive(Debug, Clone)]
pub struct VersionCatalog {
    git: Arc<GitCacheManager>,
    config: GitConfig,
}

impl VersionCatalog {
    #[must_use]
    pub fn new(git: Arc<GitCacheManager>, config: GitConfig) -> Self {
        Self { git, config }
    }

    /// Versions selectable for the primary module repository: the default
    /// branch first, then likely release tags newest-first, then remaining
    /// branches alphabetically. A listing failure degrades to an empty list.
    pub async fn primary_versions(&self) -> Vec<String> {
        let url = &self.config.modules_repo;
        let branches = self.git.list_branches(url).await;
        let tags = self.git.list_tags(url).await;
        match (branches, tags) {
            (Ok(branches), Ok(tags)) => {
                order_versions(branches.into_iter().chain(tags))
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(url, error = %e, "failed to list primary versions");
                Vec::new()
            }
        }
    }

    /// Versions selectable per dependency repository, fanned out with a
    /// bounded number of concurrent listings. A failure for one repository
    /// yields an empty list for that key, never a failed map.
    pub async fn dependency_versions(
        &self,
        remotes: &[(String, String)],
    ) -> BTreeMap<String, Vec<String>> {
        let concurrency = self.config.version_concurrency.max(1);
        stream::iter(remotes.iter().cloned())
            .map(|(name, url)| async move {
                let versions = self.repo_versions(&name, &url).await;
                (name, versions)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    async fn repo_versions(&self, name: &str, url: &str) -> Vec<String> {
        let own = match self.listed(url).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!(name, url, error = %e, "failed to list dependency versions");
                return Vec::new();
            }
        };

        // Forked dependencies are selectable from both the fork and the
        // upstream organization, disambiguated by an `Org/` prefix.
        let Some(upstream_url) = upstream_counterpart(name, url) else {
            return own;
        };

        let mut versions: Vec<String> =
            own.into_iter().map(|v| format!("OpenSPP/{v}")).collect();
        match self.listed(&upstream_url).await {
            Ok(upstream) => {
                versions.extend(upstream.into_iter().map(|v| format!("OpenG2P/{v}")));
            }
            Err(e) => {
                debug!(name, url = upstream_url, error = %e, "upstream listing unavailable");
            }
        }
        versions
    }

    /// Versions selectable per dependency named by the primary repository's
    /// manifest, freshly materialized from cache.
    pub async fn available_dependencies(
        &self,
    ) -> ControlResult<BTreeMap<String, Vec<String>>> {
        let tree = self.git.materialize(&self.config.primary_repo, None).await?;
        let text = tokio::fs::read_to_string(tree.join("odoo/custom/src/repos.yaml")).await?;
        let remotes = crate::deployment::manifest::dependency_remotes(&text)?;
        Ok(self.dependency_versions(&remotes).await)
    }

    async fn listed(&self, url: &str) -> ControlResult<Vec<String>> {
        let branches = self.git.list_branches(url).await?;
        let tags = self.git.list_tags(url).await?;
        Ok(ranked(branches, tags))
    }
}

/// Newest-first ordering within one repository: branches then tags, each
/// reverse-alphabetical (which tracks recency for date- and number-based
/// naming schemes).
#[must_use]
pub fn ranked(mut branches: Vec<String>, mut tags: Vec<String>) -> Vec<String> {
    branches.sort_unstable_by(|a, b| b.cmp(a));
    tags.sort_unstable_by(|a, b| b.cmp(a));
    branches.extend(tags);
    branches
}

/// Heuristic separating release tags from branches: a `v` prefix, an
/// `openspp-` prefix, or a three-part numeric version that is not one of
/// the long-lived series branches.
#[must_use]
pub fn is_likely_tag(version: &str) -> bool {
    static SEMVER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").unwrap());
    if BRANCH_EXCEPTIONS.contains(&version) {
        return false;
    }
    version.starts_with('v')
        || version.starts_with("openspp-")
        || SEMVER_RE.is_match(version)
}

/// Deduplicate and order a mixed branch/tag listing: default branch first,
/// then likely tags newest-first, then remaining branches alphabetically.
#[must_use]
pub fn order_versions(versions: impl IntoIterator<Item = String>) -> Vec<String> {
    let unique: std::collections::BTreeSet<String> = versions.into_iter().collect();

    let default_branch: Vec<String> = unique
        .iter()
        .filter(|v| v.as_str() == DEFAULT_BRANCH)
        .cloned()
        .collect();
    let mut tags: Vec<String> = unique
        .iter()
        .filter(|v| is_likely_tag(v) && v.as_str() != DEFAULT_BRANCH)
        .cloned()
        .collect();
    tags.sort_unstable_by(|a, b| b.cmp(a));
    let branches: Vec<String> = unique
        .iter()
        .filter(|v| v.as_str() != DEFAULT_BRANCH && !is_likely_tag(v))
        .cloned()
        .collect();

    let mut ordered = default_branch;
    ordered.extend(tags);
    ordered.extend(branches);
    ordered
}

/// Upstream URL for a forked dependency, or `None` when the dependency is
/// not forked from the upstream organization.
#[must_use]
pub fn upstream_counterpart(name: &str, url: &str) -> Option<String> {
    if name.starts_with("openg2p_") && url.contains("OpenSPP") {
        Some(url.replace("OpenSPP", "openg2p"))
    } else {
        None
    }
}
