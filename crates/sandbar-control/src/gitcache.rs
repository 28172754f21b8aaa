//! Local git mirror cache.
//!
//! One mirror directory per distinct remote URL. Fetches are TTL-gated so a
//! burst of materializations hits the network at most once per window, and a
//! per-URL async lock serializes concurrent callers so two deployments can
//! never fetch or check out the same mirror simultaneously. A mirror that
//! fails to update is deleted and re-cloned on the next call.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{GitConfig, PathsConfig};
use crate::error::{ControlError, ControlResult};
use crate::process::{Cmd, CommandError, CommandRunner};

/// Cached branch/tag listing for one repository.
#[derive(Debug, Clone)]
struct RefListing {
    branches: Vec<String>,
    tags: Vec<String>,
    fetched_at: DateTime<Utc>,
}

/// Per-repository statistics reported by [`GitCacheManager::cache_stats`].
#[derive(Debug, Clone)]
pub struct RepoStats {
    /// Mirror directory name (cache key).
    pub name: String,
    /// Remote URL the mirror tracks.
    pub url: String,
    /// On-disk size in bytes.
    pub bytes: u64,
    /// Whether the mirror is shallow.
    pub shallow: bool,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of mirrors.
    pub repo_count: usize,
    /// Total on-disk size in bytes.
    pub total_bytes: u64,
    /// Per-mirror details, largest first.
    pub repos: Vec<RepoStats>,
}

/// Manages cached git mirrors for fast deployment materialization.
pub struct GitCacheManager {
    cache_dir: PathBuf,
    ttl: Duration,
    shallow_repos: HashSet<String>,
    shallow_depth: u32,
    runner: CommandRunner,
    locks: DashMap<String, Arc<Mutex<()>>>,
    last_fetch: DashMap<String, DateTime<Utc>>,
    last_access: DashMap<String, DateTime<Utc>>,
    refs: DashMap<String, RefListing>,
}

impl GitCacheManager {
    /// Create a manager rooted at the configured cache directory.
    #[must_use]
    pub fn new(git: &GitConfig, paths: &PathsConfig, runner: CommandRunner) -> Self {
        Self {
            cache_dir: PathBuf::from(&paths.git_cache_dir),
            ttl: Duration::seconds(i64::try_from(git.cache_ttl_secs).unwrap_or(300)),
            shallow_repos: git.shallow_repos.iter().cloned().collect(),
            shallow_depth: git.shallow_depth,
            runner,
            locks: DashMap::new(),
            last_fetch: DashMap::new(),
            last_access: DashMap::new(),
            refs: DashMap::new(),
        }
    }

    /// Deterministic mirror directory name for a remote URL,
    /// e.g. `https://github.com/openspp/openspp-modules.git`
    /// -> `openspp_openspp-modules`.
    #[must_use]
    pub fn cache_key(url: &str) -> String {
        let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() >= 2 {
            format!("{}_{}", parts[parts.len() - 2], parts[parts.len() - 1])
        } else {
            trimmed.replace(['/', ':'], "_")
        }
    }

    /// Path of the mirror directory for a URL (whether or not it exists).
    #[must_use]
    pub fn mirror_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(Self::cache_key(url))
    }

    fn is_shallow_repo(&self, url: &str) -> bool {
        self.shallow_repos.contains(url)
    }

    fn fetch_due(&self, url: &str) -> bool {
        self.last_fetch
            .get(url)
            .is_none_or(|at| Utc::now() - *at > self.ttl)
    }

    fn record_fetch(&self, url: &str) {
        self.last_fetch.insert(url.to_owned(), Utc::now());
    }

    fn record_access(&self, url: &str) {
        self.last_access.insert(url.to_owned(), Utc::now());
    }

    fn url_lock(&self, url: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(url.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> ControlResult<String> {
        let cmd = Cmd::new("git").current_dir(repo).args(args.iter().copied());
        self.runner
            .run(&cmd)
            .await
            .map(|out| out.stdout)
            .map_err(git_error)
    }

    /// Ensure a fresh mirror for `url` and return its path.
    ///
    /// Holds the per-URL lock for the whole operation. If the mirror exists
    /// and was fetched within the freshness window, no network round-trip
    /// happens; a requested `branch` is still checked out locally.
    pub async fn materialize(&self, url: &str, branch: Option<&str>) -> ControlResult<PathBuf> {
        let lock = self.url_lock(url);
        let _guard = lock.lock().await;
        self.materialize_locked(url, branch).await
    }

    async fn materialize_locked(&self, url: &str, branch: Option<&str>) -> ControlResult<PathBuf> {
        self.record_access(url);
        let path = self.mirror_path(url);

        if path.exists() {
            if !self.fetch_due(url) {
                debug!(url, "mirror still fresh, skipping fetch");
                if let Some(branch) = branch {
                    self.git(&path, &["checkout", branch]).await?;
                }
                return Ok(path);
            }

            match self.update_mirror(url, &path, branch).await {
                Ok(()) => return Ok(path),
                Err(e) => {
                    warn!(url, error = %e, "mirror update failed, removing for re-clone");
                    tokio::fs::remove_dir_all(&path).await?;
                }
            }
        }

        self.clone_mirror(url, &path, branch).await?;
        Ok(path)
    }

    async fn update_mirror(
        &self,
        url: &str,
        path: &Path,
        branch: Option<&str>,
    ) -> ControlResult<()> {
        info!(url, "updating cached mirror");
        if self.is_shallow_repo(url) {
            let depth = self.shallow_depth.to_string();
            self.git(path, &["fetch", "--depth", &depth, "origin"]).await?;
            // Shallow fetches drop tag visibility without an explicit pass.
            self.git(path, &["fetch", "--tags", "--depth", &depth]).await?;
        } else {
            self.git(path, &["fetch", "--all", "--tags"]).await?;
        }
        self.record_fetch(url);

        if let Some(branch) = branch {
            self.git(path, &["checkout", branch]).await?;
            // Branches track the remote; for a tag checkout there is no
            // origin ref and the reset is skipped.
            let origin_ref = format!("origin/{branch}");
            if self
                .git(path, &["rev-parse", "--verify", &origin_ref])
                .await
                .is_ok()
            {
                self.git(path, &["reset", "--hard", &origin_ref]).await?;
            }
        }
        Ok(())
    }

    async fn clone_mirror(
        &self,
        url: &str,
        path: &Path,
        branch: Option<&str>,
    ) -> ControlResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(url, path = %path.display(), "cloning repository into cache");
        let mut cmd = Cmd::new("git").arg("clone");
        if self.is_shallow_repo(url) {
            cmd = cmd
                .arg("--depth")
                .arg(self.shallow_depth.to_string())
                .arg("--single-branch");
        } else {
            cmd = cmd.arg("--no-single-branch");
        }
        if let Some(branch) = branch {
            cmd = cmd.arg("--branch").arg(branch);
        }
        cmd = cmd.arg(url).arg(path.display().to_string());

        self.runner.run(&cmd).await.map_err(git_error)?;

        if self.is_shallow_repo(url) {
            let depth = self.shallow_depth.to_string();
            self.git(path, &["fetch", "--tags", "--depth", &depth]).await?;
        }
        self.record_fetch(url);
        Ok(())
    }

    /// List remote branches, using the short-TTL in-memory cache when fresh.
    pub async fn list_branches(&self, url: &str) -> ControlResult<Vec<String>> {
        if let Some(listing) = self.fresh_listing(url) {
            return Ok(listing.branches);
        }
        let listing = self.refresh_listing(url).await?;
        Ok(listing.branches)
    }

    /// List tags, newest-sorting first, using the in-memory cache when fresh.
    pub async fn list_tags(&self, url: &str) -> ControlResult<Vec<String>> {
        if let Some(listing) = self.fresh_listing(url) {
            return Ok(listing.tags);
        }
        let listing = self.refresh_listing(url).await?;
        Ok(listing.tags)
    }

    fn fresh_listing(&self, url: &str) -> Option<RefListing> {
        let listing = self.refs.get(url)?;
        (Utc::now() - listing.fetched_at < self.ttl).then(|| listing.value().clone())
    }

    async fn refresh_listing(&self, url: &str) -> ControlResult<RefListing> {
        let path = self.materialize(url, None).await?;

        let raw = self
            .git(
                &path,
                &[
                    "for-each-ref",
                    "--format=%(refname:short)",
                    "refs/remotes/origin",
                ],
            )
            .await?;
        let mut branches: Vec<String> = raw
            .lines()
            .filter_map(|line| line.trim().strip_prefix("origin/"))
            .filter(|name| *name != "HEAD" && !name.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        branches.sort();
        branches.dedup();

        let raw = self.git(&path, &["tag", "--list"]).await?;
        let mut tags: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        tags.sort_by(|a, b| b.cmp(a));

        let listing = RefListing {
            branches,
            tags,
            fetched_at: Utc::now(),
        };
        self.refs.insert(url.to_owned(), listing.clone());
        Ok(listing)
    }

    /// Copy the mirror's working tree to `dest`, cloning into cache first if
    /// the mirror is missing. With `include_history` false the `.git`
    /// directory is excluded.
    pub async fn copy_to(
        &self,
        url: &str,
        dest: &Path,
        include_history: bool,
    ) -> ControlResult<()> {
        let lock = self.url_lock(url);
        let _guard = lock.lock().await;
        self.record_access(url);

        let src = self.mirror_path(url);
        if !src.exists() {
            self.materialize_locked(url, None).await?;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest, !include_history))
            .await
            .map_err(|e| ControlError::internal(format!("copy task panicked: {e}")))??;
        Ok(())
    }

    /// Remove mirrors neither accessed nor modified within the last
    /// `max_age_days` days. Returns the number of bytes freed.
    ///
    /// A fresh materialization skips the fetch and leaves the directory
    /// mtime alone, so recency is judged by the recorded access time where
    /// one exists, with the mtime as the floor.
    pub async fn evict_older_than(&self, max_age_days: u32) -> ControlResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let mut freed = 0u64;

        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
            let accessed = self
                .last_access
                .iter()
                .filter(|kv| Self::cache_key(kv.key()) == name)
                .map(|kv| *kv.value())
                .max();
            if accessed.map_or(modified, |at| at.max(modified)) >= cutoff {
                continue;
            }

            let size = dir_size(path.clone()).await?;
            info!(mirror = %path.display(), bytes = size, "evicting stale mirror");
            tokio::fs::remove_dir_all(&path).await?;
            freed += size;

            self.last_fetch.retain(|url, _| Self::cache_key(url) != name);
            self.last_access.retain(|url, _| Self::cache_key(url) != name);
            self.refs.retain(|url, _| Self::cache_key(url) != name);
        }
        Ok(freed)
    }

    /// Destructively re-clone an existing full mirror at a bounded depth,
    /// preserving the currently checked-out branch.
    pub async fn convert_to_shallow(&self, url: &str, depth: u32) -> ControlResult<()> {
        let lock = self.url_lock(url);
        let _guard = lock.lock().await;

        let path = self.mirror_path(url);
        if !path.exists() {
            return Err(ControlError::git(format!("no cached mirror for {url}")));
        }

        let branch = self
            .git(&path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_owned();
        tokio::fs::remove_dir_all(&path).await?;

        let depth_s = depth.to_string();
        let mut cmd = Cmd::new("git")
            .arg("clone")
            .arg("--depth")
            .arg(&depth_s)
            .arg("--single-branch");
        if branch != "HEAD" {
            cmd = cmd.arg("--branch").arg(&branch);
        }
        cmd = cmd.arg(url).arg(path.display().to_string());
        self.runner.run(&cmd).await.map_err(git_error)?;

        self.git(&path, &["fetch", "--tags", "--depth", &depth_s])
            .await?;
        self.record_fetch(url);
        info!(url, depth, "converted mirror to shallow");
        Ok(())
    }

    /// Run mirror maintenance (`gc`, `prune`, reflog expiry) on one mirror.
    /// Returns bytes saved.
    pub async fn optimize(&self, url: &str) -> ControlResult<u64> {
        let lock = self.url_lock(url);
        let _guard = lock.lock().await;

        let path = self.mirror_path(url);
        if !path.exists() {
            return Ok(0);
        }

        let before = dir_size(path.clone()).await?;
        self.git(&path, &["reflog", "expire", "--expire=now", "--all"])
            .await?;
        self.git(&path, &["gc", "--aggressive", "--prune=now"]).await?;
        self.git(&path, &["prune"]).await?;
        let after = dir_size(path).await?;
        Ok(before.saturating_sub(after))
    }

    /// Remove every mirror and reset all in-memory state.
    pub async fn clear(&self) -> ControlResult<()> {
        if self.cache_dir.exists() {
            tokio::fs::remove_dir_all(&self.cache_dir).await?;
        }
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        self.last_fetch.clear();
        self.last_access.clear();
        self.refs.clear();
        info!("cleared git cache");
        Ok(())
    }

    /// Statistics over all cached mirrors, largest first.
    pub async fn cache_stats(&self) -> ControlResult<CacheStats> {
        let mut stats = CacheStats::default();

        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.join(".git").exists() {
                continue;
            }
            let bytes = dir_size(path.clone()).await?;
            let url = self
                .git(&path, &["remote", "get-url", "origin"])
                .await
                .map(|out| out.trim().to_owned())
                .unwrap_or_default();
            stats.repos.push(RepoStats {
                name: entry.file_name().to_string_lossy().into_owned(),
                url,
                bytes,
                shallow: path.join(".git/shallow").exists(),
            });
            stats.total_bytes += bytes;
        }

        stats.repo_count = stats.repos.len();
        stats.repos.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        Ok(stats)
    }

    /// Warm the cache for several repositories; failures are logged per URL
    /// and do not abort the rest.
    pub async fn prewarm(&self, urls: &[String]) {
        info!(count = urls.len(), "pre-warming git cache");
        for url in urls {
            if let Err(e) = self.list_branches(url).await {
                warn!(url, error = %e, "failed to pre-warm mirror");
                continue;
            }
            if let Err(e) = self.list_tags(url).await {
                warn!(url, error = %e, "failed to pre-warm tags");
            }
        }
    }

    #[cfg(test)]
    fn backdate_fetch(&self, url: &str, age: Duration) {
        self.last_fetch.insert(url.to_owned(), Utc::now() - age);
    }
}

impl std::fmt::Debug for GitCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCacheManager")
            .field("cache_dir", &self.cache_dir)
            .field("ttl", &self.ttl)
            .field("shallow_repos", &self.shallow_repos)
            .finish_non_exhaustive()
    }
}

fn git_error(e: CommandError) -> ControlError {
    if e.transient {
        ControlError::Transient(e.to_string())
    } else {
        ControlError::Git(e.stderr.trim().to_owned())
    }
}

/// Recursive copy of `src` into `dst`, optionally skipping `.git`.
fn copy_tree(src: &Path, dst: &Path, exclude_git: bool) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if exclude_git && name == ".git" {
            continue;
        }
        let target = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target, exclude_git)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn dir_size(path: PathBuf) -> ControlResult<u64> {
    tokio::task::spawn_blocking(move || dir_size_sync(&path))
        .await
        .map_err(|e| ControlError::internal(format!("size task panicked: {e}")))?
        .map_err(ControlError::from)
}

fn dir_size_sync(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size_sync(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GitConfig, PathsConfig};

    fn manager_at(dir: &Path) -> GitCacheManager {
        let paths = PathsConfig {
            deployments_dir: dir.join("deployments").display().to_string(),
            git_cache_dir: dir.join("git-cache").display().to_string(),
        };
        GitCacheManager::new(&GitConfig::default(), &paths, CommandRunner::default())
    }

    #[test]
    fn cache_key_is_org_and_repo() {
        assert_eq!(
            GitCacheManager::cache_key("https://github.com/openspp/openspp-modules.git"),
            "openspp_openspp-modules"
        );
        assert_eq!(
            GitCacheManager::cache_key("https://github.com/odoo/odoo.git"),
            "odoo_odoo"
        );
        assert_eq!(
            GitCacheManager::cache_key("https://github.com/OpenSPP/openspp-docker"),
            "OpenSPP_openspp-docker"
        );
    }

    #[test]
    fn fetch_gating_respects_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_at(tmp.path());
        let url = "https://github.com/openspp/openspp-modules.git";

        // Never fetched: due.
        assert!(manager.fetch_due(url));

        // Just fetched: not due within the window.
        manager.record_fetch(url);
        assert!(!manager.fetch_due(url));

        // Older than the window: due again.
        manager.backdate_fetch(url, Duration::seconds(301));
        assert!(manager.fetch_due(url));
    }

    #[test]
    fn listing_cache_expires_with_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_at(tmp.path());
        let url = "https://github.com/openspp/openspp-modules.git";

        manager.refs.insert(
            url.to_owned(),
            RefListing {
                branches: vec!["17.0".to_owned()],
                tags: vec!["v17.0.1".to_owned()],
                fetched_at: Utc::now(),
            },
        );
        assert!(manager.fresh_listing(url).is_some());

        manager.refs.insert(
            url.to_owned(),
            RefListing {
                branches: vec![],
                tags: vec![],
                fetched_at: Utc::now() - Duration::seconds(301),
            },
        );
        assert!(manager.fresh_listing(url).is_none());
    }

    #[test]
    fn copy_tree_can_exclude_git_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join(".git")).unwrap();
        std::fs::create_dir_all(src.join("odoo/custom")).unwrap();
        std::fs::write(src.join(".git/config"), "[core]").unwrap();
        std::fs::write(src.join("odoo/custom/repos.yaml"), "odoo: {}").unwrap();

        let with_history = tmp.path().join("with");
        copy_tree(&src, &with_history, false).unwrap();
        assert!(with_history.join(".git/config").exists());
        assert!(with_history.join("odoo/custom/repos.yaml").exists());

        let without_history = tmp.path().join("without");
        copy_tree(&src, &without_history, true).unwrap();
        assert!(!without_history.join(".git").exists());
        assert!(without_history.join("odoo/custom/repos.yaml").exists());
    }

    #[tokio::test]
    async fn evict_ignores_missing_cache_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_at(tmp.path());
        assert_eq!(manager.evict_older_than(30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn evict_removes_only_stale_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_at(tmp.path());

        let fresh = manager.cache_dir.join("openspp_openspp-modules");
        std::fs::create_dir_all(&fresh).unwrap();
        std::fs::write(fresh.join("README.md"), "fresh").unwrap();

        // Directory mtimes are current, so nothing is older than a day.
        assert_eq!(manager.evict_older_than(1).await.unwrap(), 0);
        assert!(fresh.exists());

        // Age cutoff of zero days removes everything modified before now.
        let freed = manager.evict_older_than(0).await.unwrap();
        assert!(freed > 0);
        assert!(!fresh.exists());
    }

    #[tokio::test]
    async fn evict_spares_recently_accessed_mirrors() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_at(tmp.path());
        let url = "https://github.com/openspp/openspp-modules.git";

        let hot = manager.mirror_path(url);
        std::fs::create_dir_all(&hot).unwrap();
        std::fs::write(hot.join("README.md"), "hot").unwrap();

        let cold = manager.cache_dir.join("odoo_odoo");
        std::fs::create_dir_all(&cold).unwrap();
        std::fs::write(cold.join("README.md"), "cold").unwrap();

        // An access newer than the directory mtime keeps the mirror alive
        // even at a zero-day cutoff; the never-accessed one goes.
        manager.record_access(url);
        let freed = manager.evict_older_than(0).await.unwrap();
        assert!(freed > 0);
        assert!(hot.exists());
        assert!(!cold.exists());
    }

    #[tokio::test]
    async fn stats_on_empty_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_at(tmp.path());
        let stats = manager.cache_stats().await.unwrap();
        assert_eq!(stats.repo_count, 0);
        assert_eq!(stats.total_bytes, 0);
    }
}
