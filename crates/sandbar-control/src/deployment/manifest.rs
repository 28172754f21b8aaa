//! Dependency-manifest (repos.yaml) rewriting and generated-config fixups.
//!
//! The materialized source tree carries a manifest listing each dependency
//! repository's remotes and target ref. Only the `target`/`merges` fields
//! are ever rewritten here, plus one known-conflicting entry that is removed
//! outright because its modules duplicate another dependency's.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::error::{ControlError, ControlResult};

/// Manifest location relative to a deployment's working directory.
pub const REPOS_YAML_REL: &str = "openspp-docker/odoo/custom/src/repos.yaml";

/// Vendored-source directory relative to a deployment's working directory.
pub const SRC_DIR_REL: &str = "openspp-docker/odoo/custom/src";

/// Generated compose file relative to a deployment's working directory.
pub const COMPOSE_YAML_REL: &str = "openspp-docker/docker-compose.yml";

/// Manifest key of the primary module repository.
pub const PRIMARY_DEP: &str = "openspp_modules";

/// Dependency removed from every manifest; its modules are already shipped
/// by `openg2p_registry` and aggregating both collides.
pub const CONFLICTING_DEP: &str = "openg2p_auth";

/// Manifest key of the core framework checkout, never version-pinned here.
const ODOO_DEP: &str = "./odoo";

/// Container-port to environment-variable mapping used when un-hardcoding
/// generated loopback port bindings.
const PORT_VARS: &[(u16, &str)] = &[
    (8025, "SMTP_PORT"),
    (8081, "PGWEB_PORT"),
    (1984, "DEBUGGER_PORT"),
    (8069, "ODOO_PORT"),
    (8072, "ODOO_PORT_LONGPOLLING"),
    (6899, "ODOO_PROXY_PORT"),
    (5432, "DB_PORT"),
];

/// Pin the primary repository and every overridden dependency to the
/// requested refs, returning the rewritten manifest text.
///
/// An `Org/ref` override on a forked dependency additionally switches the
/// remote URL's organization segment before pinning to `ref`.
pub fn rewrite_repos(
    text: &str,
    primary_version: &str,
    overrides: &BTreeMap<String, String>,
) -> ControlResult<String> {
    let mut repos: Mapping = serde_yaml::from_str(text)?;

    repos.remove(CONFLICTING_DEP);

    if !primary_version.is_empty() {
        if let Some(Value::Mapping(entry)) = repos.get_mut(PRIMARY_DEP) {
            let remote = first_remote_name(entry).unwrap_or_else(|| "openspp".to_owned());
            pin(entry, &remote, primary_version);
        }
    }

    for (dep, version) in overrides {
        if version.is_empty() || dep == ODOO_DEP {
            continue;
        }
        let Some(Value::Mapping(entry)) = repos.get_mut(dep.as_str()) else {
            continue;
        };

        if let Some((prefix, target_ref)) =
            version.split_once('/').filter(|_| dep.starts_with("openg2p_"))
        {
            let org = canonical_org(prefix);
            if let Some(Value::Mapping(remotes)) = entry.get_mut("remotes") {
                if let Some((_, url)) = remotes.iter_mut().next() {
                    if let Value::String(url) = url {
                        *url = select_org(url, org);
                    }
                }
            }
            let remote = first_remote_name(entry).unwrap_or_else(|| "origin".to_owned());
            pin(entry, &remote, target_ref);
        } else {
            let remote = first_remote_name(entry).unwrap_or_else(|| "origin".to_owned());
            pin(entry, &remote, version);
        }
    }

    serde_yaml::to_string(&repos).map_err(ControlError::from)
}

fn first_remote_name(entry: &Mapping) -> Option<String> {
    match entry.get("remotes") {
        Some(Value::Mapping(remotes)) => remotes
            .iter()
            .next()
            .and_then(|(k, _)| k.as_str())
            .map(ToOwned::to_owned),
        _ => None,
    }
}

fn pin(entry: &mut Mapping, remote: &str, version: &str) {
    let pinned = format!("{remote} {version}");
    entry.insert(
        Value::String("target".to_owned()),
        Value::String(pinned.clone()),
    );
    entry.insert(
        Value::String("merges".to_owned()),
        Value::Sequence(vec![Value::String(pinned)]),
    );
}

/// Resolve a version-override org prefix to the git organization it names.
/// The upstream org is lowercase on the hosting side even though version
/// labels carry it capitalized; everything else resolves to the fork.
#[must_use]
pub fn canonical_org(prefix: &str) -> &'static str {
    if prefix.eq_ignore_ascii_case("openg2p") {
        "openg2p"
    } else {
        "OpenSPP"
    }
}

/// Swap the organization path segment of a dependency remote URL. The fork
/// and its upstream share the repository name, differing only in org.
#[must_use]
pub fn select_org(url: &str, org: &str) -> String {
    let replacement = format!("/{org}/");
    url.replacen("/OpenSPP/", &replacement, 1)
        .replacen("/openg2p/", &replacement, 1)
}

/// Dependency repositories and their first remote URL, for version listing.
pub fn dependency_remotes(text: &str) -> ControlResult<Vec<(String, String)>> {
    let repos: Mapping = serde_yaml::from_str(text)?;
    let mut remotes = Vec::new();
    for (key, entry) in &repos {
        let Some(name) = key.as_str() else { continue };
        if name == ODOO_DEP {
            continue;
        }
        let Value::Mapping(entry) = entry else { continue };
        if let Some(Value::Mapping(repo_remotes)) = entry.get("remotes") {
            if let Some((_, url)) = repo_remotes.iter().next() {
                if let Some(url) = url.as_str() {
                    remotes.push((name.to_owned(), url.to_owned()));
                }
            }
        }
    }
    Ok(remotes)
}

/// Every repository to pre-populate from the mirror cache before
/// aggregation, as `(directory name, first remote URL)` pairs. Includes the
/// core checkout (under its plain directory name) but never the removed
/// conflicting dependency.
pub fn all_remotes(text: &str) -> ControlResult<Vec<(String, String)>> {
    let repos: Mapping = serde_yaml::from_str(text)?;
    let mut remotes = Vec::new();
    for (key, entry) in &repos {
        let Some(name) = key.as_str() else { continue };
        if name == CONFLICTING_DEP {
            continue;
        }
        let Value::Mapping(entry) = entry else { continue };
        if let Some(Value::Mapping(repo_remotes)) = entry.get("remotes") {
            if let Some((_, url)) = repo_remotes.iter().next() {
                if let Some(url) = url.as_str() {
                    let dir = name.trim_start_matches("./").to_owned();
                    remotes.push((dir, url.to_owned()));
                }
            }
        }
    }
    Ok(remotes)
}

/// Replace literal loopback port bindings in a generated compose file with
/// references to the deployment's environment variables, so configs derived
/// from a shared template cannot collide across deployments. Returns the
/// rewritten text and whether anything changed.
#[must_use]
pub fn rewrite_compose_ports(text: &str) -> (String, bool) {
    static REWRITES: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
        PORT_VARS
            .iter()
            .map(|(port, var)| {
                let pattern =
                    format!(r#"(["']*127\.0\.0\.1:)\d{{4,5}}(:{port}["']*)"#);
                let replacement = format!("${{1}}$${{{var}}}${{2}}");
                (Regex::new(&pattern).unwrap(), replacement)
            })
            .collect()
    });

    let mut out = text.to_owned();
    let mut changed = false;
    for (re, replacement) in REWRITES.iter() {
        if re.is_match(&out) {
            out = re.replace_all(&out, replacement.as_str()).into_owned();
            changed = true;
        }
    }
    (out, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
./odoo:
  defaults:
    depth: 1
  remotes:
    origin: https://github.com/odoo/odoo.git
  target: origin 17.0
openspp_modules:
  remotes:
    openspp: https://github.com/OpenSPP/openspp-modules.git
  target: openspp 17.0
  merges:
    - openspp 17.0
openg2p_registry:
  remotes:
    openg2p: https://github.com/OpenSPP/openg2p-registry.git
  target: openg2p 17.0-develop
  merges:
    - openg2p 17.0-develop
openg2p_auth:
  remotes:
    openg2p: https://github.com/OpenSPP/openg2p-auth.git
  target: openg2p 17.0
"#;

    #[test]
    fn conflicting_dependency_is_removed() {
        let out = rewrite_repos(SAMPLE, "17.0", &BTreeMap::new()).unwrap();
        assert!(!out.contains("openg2p_auth"));
        assert!(out.contains("openg2p_registry"));
    }

    #[test]
    fn primary_is_pinned_via_its_remote_name() {
        let out = rewrite_repos(SAMPLE, "v17.0.1.2.1", &BTreeMap::new()).unwrap();
        let repos: Mapping = serde_yaml::from_str(&out).unwrap();
        let Some(Value::Mapping(entry)) = repos.get(PRIMARY_DEP) else {
            panic!("missing entry");
        };
        assert_eq!(
            entry.get("target").and_then(Value::as_str),
            Some("openspp v17.0.1.2.1")
        );
        let Some(Value::Sequence(merges)) = entry.get("merges") else {
            panic!("missing merges");
        };
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].as_str(), Some("openspp v17.0.1.2.1"));
    }

    #[test]
    fn plain_override_pins_target_and_merges() {
        let overrides =
            BTreeMap::from([("openg2p_registry".to_owned(), "17.0-main".to_owned())]);
        let out = rewrite_repos(SAMPLE, "17.0", &overrides).unwrap();
        let repos: Mapping = serde_yaml::from_str(&out).unwrap();
        let Some(Value::Mapping(entry)) = repos.get("openg2p_registry") else {
            panic!("missing entry");
        };
        assert_eq!(
            entry.get("target").and_then(Value::as_str),
            Some("openg2p 17.0-main")
        );
    }

    #[test]
    fn org_override_switches_remote_and_strips_prefix() {
        let overrides = BTreeMap::from([(
            "openg2p_registry".to_owned(),
            "OpenG2P/17.0-develop".to_owned(),
        )]);
        let out = rewrite_repos(SAMPLE, "17.0", &overrides).unwrap();
        let repos: Mapping = serde_yaml::from_str(&out).unwrap();
        let Some(Value::Mapping(entry)) = repos.get("openg2p_registry") else {
            panic!("missing entry");
        };
        let Some(Value::Mapping(remotes)) = entry.get("remotes") else {
            panic!("missing remotes");
        };
        let (_, url) = remotes.iter().next().unwrap();
        assert_eq!(
            url.as_str(),
            Some("https://github.com/openg2p/openg2p-registry.git")
        );
        assert_eq!(
            entry.get("target").and_then(Value::as_str),
            Some("openg2p 17.0-develop")
        );
    }

    #[test]
    fn org_prefix_resolves_to_hosted_organization() {
        assert_eq!(canonical_org("OpenG2P"), "openg2p");
        assert_eq!(canonical_org("openg2p"), "openg2p");
        assert_eq!(canonical_org("OpenSPP"), "OpenSPP");
        assert_eq!(canonical_org("anything-else"), "OpenSPP");
    }

    #[test]
    fn fork_prefix_override_keeps_the_fork_remote() {
        let overrides = BTreeMap::from([(
            "openg2p_registry".to_owned(),
            "OpenSPP/17.0-custom".to_owned(),
        )]);
        let out = rewrite_repos(SAMPLE, "17.0", &overrides).unwrap();
        let repos: Mapping = serde_yaml::from_str(&out).unwrap();
        let Some(Value::Mapping(entry)) = repos.get("openg2p_registry") else {
            panic!("missing entry");
        };
        let Some(Value::Mapping(remotes)) = entry.get("remotes") else {
            panic!("missing remotes");
        };
        let (_, url) = remotes.iter().next().unwrap();
        assert_eq!(
            url.as_str(),
            Some("https://github.com/OpenSPP/openg2p-registry.git")
        );
        assert_eq!(
            entry.get("target").and_then(Value::as_str),
            Some("openg2p 17.0-custom")
        );
    }

    #[test]
    fn org_swap_is_limited_to_the_org_segment() {
        assert_eq!(
            select_org("https://github.com/OpenSPP/openg2p-registry.git", "openg2p"),
            "https://github.com/openg2p/openg2p-registry.git"
        );
        assert_eq!(
            select_org("https://github.com/openg2p/openg2p-registry.git", "OpenSPP"),
            "https://github.com/OpenSPP/openg2p-registry.git"
        );
    }

    #[test]
    fn remotes_listing_skips_the_core_checkout() {
        let remotes = dependency_remotes(SAMPLE).unwrap();
        let names: Vec<&str> = remotes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["openspp_modules", "openg2p_registry", "openg2p_auth"]
        );
        assert_eq!(
            remotes[0].1,
            "https://github.com/OpenSPP/openspp-modules.git"
        );
    }

    #[test]
    fn prepopulation_list_includes_the_core_checkout() {
        let remotes = all_remotes(SAMPLE).unwrap();
        let names: Vec<&str> = remotes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["odoo", "openspp_modules", "openg2p_registry"]);
    }

    #[test]
    fn compose_ports_are_replaced_with_variables() {
        let compose = r#"
services:
  odoo:
    ports:
      - "127.0.0.1:18000:8069"
      - 127.0.0.1:18072:8072
  smtp:
    ports:
      - '127.0.0.1:18025:8025'
  db:
    ports:
      - "127.0.0.1:18032:5432"
"#;
        let (out, changed) = rewrite_compose_ports(compose);
        assert!(changed);
        assert!(out.contains(r#""127.0.0.1:${ODOO_PORT}:8069""#));
        assert!(out.contains("127.0.0.1:${ODOO_PORT_LONGPOLLING}:8072"));
        assert!(out.contains("'127.0.0.1:${SMTP_PORT}:8025'"));
        assert!(out.contains(r#""127.0.0.1:${DB_PORT}:5432""#));
    }

    #[test]
    fn compose_without_literal_ports_is_untouched() {
        let compose = "services:\n  odoo:\n    ports:\n      - \"127.0.0.1:${ODOO_PORT}:8069\"\n";
        let (out, changed) = rewrite_compose_ports(compose);
        assert!(!changed);
        assert_eq!(out, compose);
    }
}
