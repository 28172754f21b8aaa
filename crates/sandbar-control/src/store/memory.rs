//! In-memory deployment store for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::PortsConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{Deployment, DeploymentId, DeploymentStatus, PortAllocation};

use super::{find_free_base, DeploymentFilter, DeploymentStore};

#[derive(Debug, Default)]
struct Inner {
    deployments: HashMap<String, Deployment>,
    allocations: BTreeMap<u16, PortAllocation>,
}

/// Deployment store backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    ports: PortsConfig,
}

impl MemoryStore {
    /// Create an empty store over the given port range.
    #[must_use]
    pub fn new(ports: PortsConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            ports,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(PortsConfig::default())
    }
}

fn poisoned() -> ControlError {
    ControlError::internal("memory store lock poisoned")
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn save(&self, deployment: &Deployment) -> ControlResult<()> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner
            .deployments
            .insert(deployment.id.as_str().to_owned(), deployment.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<Deployment>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.deployments.get(id.as_str()).cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<Deployment>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut matches: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| {
                filter
                    .tester_email
                    .as_ref()
                    .is_none_or(|email| &d.tester_email == email)
                    && filter.status.is_none_or(|status| d.status == status)
                    && filter.environment.is_none_or(|env| d.environment == env)
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset.unwrap_or(0) as usize;
        let matches: Vec<Deployment> = matches.into_iter().skip(offset).collect();
        if let Some(limit) = filter.limit {
            return Ok(matches.into_iter().take(limit as usize).collect());
        }
        Ok(matches)
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.deployments.remove(id.as_str()).is_none() {
            return Err(ControlError::NotFound(id.to_string()));
        }
        inner
            .allocations
            .retain(|_, alloc| alloc.deployment_id != *id);
        Ok(())
    }

    async fn count_for_tester(&self, email: &str) -> ControlResult<u32> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let count = inner
            .deployments
            .values()
            .filter(|d| d.tester_email == email)
            .count();
        u32::try_from(count).map_err(|_| ControlError::internal("deployment count overflow"))
    }

    async fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        last_action: Option<&str>,
    ) -> ControlResult<()> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let deployment = inner
            .deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;
        deployment.status = status;
        if let Some(action) = last_action {
            deployment.last_action = Some(action.to_owned());
        }
        deployment.last_updated = Utc::now();
        Ok(())
    }

    async fn allocate_port(&self, deployment: &Deployment, increment: u16) -> ControlResult<u16> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let allocated: Vec<u16> = inner.allocations.keys().copied().collect();

        let ports = PortsConfig {
            increment,
            ..self.ports.clone()
        };
        let base = find_free_base(&allocated, &ports).ok_or(ControlError::ResourceExhausted {
            start: self.ports.range_start,
            end: self.ports.range_end,
            increment,
        })?;

        inner.allocations.insert(
            base,
            PortAllocation {
                port_base: base,
                deployment_id: deployment.id.clone(),
                allocated_at: Utc::now(),
            },
        );
        let mut record = deployment.clone();
        record.port_base = base;
        record.last_updated = Utc::now();
        inner
            .deployments
            .insert(record.id.as_str().to_owned(), record);
        Ok(base)
    }

    async fn list_allocations(&self) -> ControlResult<Vec<PortAllocation>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.allocations.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;
    use std::collections::BTreeMap;

    fn test_deployment(name: &str, email: &str) -> Deployment {
        Deployment::new(
            name.to_owned(),
            email.to_owned(),
            "17.0".to_owned(),
            BTreeMap::new(),
            Environment::Devel,
            "secret".to_owned(),
        )
    }

    #[tokio::test]
    async fn save_and_get() {
        let store = MemoryStore::default();
        let deployment = test_deployment("app1", "a@x.com");
        store.save(&deployment).await.unwrap();

        let fetched = store.get(&deployment.id).await.unwrap().unwrap();
        assert_eq!(fetched.id.as_str(), "a-app1");
        assert_eq!(fetched.status, DeploymentStatus::Creating);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = MemoryStore::default();
        let missing = store.get(&DeploymentId::new("nope")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn sequential_allocations_step_by_increment() {
        let store = MemoryStore::default();
        for (k, name) in ["app1", "app2", "app3"].iter().enumerate() {
            let deployment = test_deployment(name, "a@x.com");
            let base = store.allocate_port(&deployment, 100).await.unwrap();
            assert_eq!(base, 18000 + (k as u16) * 100);
        }
    }

    #[tokio::test]
    async fn freed_gap_is_reused() {
        let store = MemoryStore::default();
        let d1 = test_deployment("app1", "a@x.com");
        let d2 = test_deployment("app2", "a@x.com");
        let d3 = test_deployment("app3", "a@x.com");
        store.allocate_port(&d1, 100).await.unwrap();
        store.allocate_port(&d2, 100).await.unwrap();
        store.allocate_port(&d3, 100).await.unwrap();

        store.delete(&d2.id).await.unwrap();

        let d4 = test_deployment("app4", "a@x.com");
        let base = store.allocate_port(&d4, 100).await.unwrap();
        assert_eq!(base, 18100);
    }

    #[tokio::test]
    async fn exhaustion_leaves_no_partial_record() {
        let store = MemoryStore::new(PortsConfig {
            range_start: 18000,
            range_end: 18200,
            increment: 100,
        });
        store
            .allocate_port(&test_deployment("app1", "a@x.com"), 100)
            .await
            .unwrap();
        store
            .allocate_port(&test_deployment("app2", "a@x.com"), 100)
            .await
            .unwrap();

        let overflow = test_deployment("app3", "a@x.com");
        let err = store.allocate_port(&overflow, 100).await.unwrap_err();
        assert!(matches!(err, ControlError::ResourceExhausted { .. }));
        assert!(store.get(&overflow.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_record_and_allocation() {
        let store = MemoryStore::default();
        let deployment = test_deployment("app1", "a@x.com");
        store.allocate_port(&deployment, 100).await.unwrap();

        store.delete(&deployment.id).await.unwrap();

        assert!(store.get(&deployment.id).await.unwrap().is_none());
        assert!(store.list_allocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::default();
        let err = store.delete(&DeploymentId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn count_for_tester_scopes_by_email() {
        let store = MemoryStore::default();
        store
            .save(&test_deployment("app1", "a@x.com"))
            .await
            .unwrap();
        store
            .save(&test_deployment("app2", "a@x.com"))
            .await
            .unwrap();
        store
            .save(&test_deployment("other", "b@x.com"))
            .await
            .unwrap();

        assert_eq!(store.count_for_tester("a@x.com").await.unwrap(), 2);
        assert_eq!(store.count_for_tester("b@x.com").await.unwrap(), 1);
        assert_eq!(store.count_for_tester("c@x.com").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_with_filters() {
        let store = MemoryStore::default();
        let mut running = test_deployment("app1", "a@x.com");
        running.status = DeploymentStatus::Running;
        store.save(&running).await.unwrap();
        store
            .save(&test_deployment("app2", "b@x.com"))
            .await
            .unwrap();

        let by_status = store
            .list(&DeploymentFilter::new().with_status(DeploymentStatus::Running))
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].id.as_str(), "a-app1");

        let by_tester = store
            .list(&DeploymentFilter::new().with_tester("b@x.com"))
            .await
            .unwrap();
        assert_eq!(by_tester.len(), 1);
    }

    #[tokio::test]
    async fn update_status_sets_diagnostic() {
        let store = MemoryStore::default();
        let deployment = test_deployment("app1", "a@x.com");
        store.save(&deployment).await.unwrap();

        store
            .update_status(
                &deployment.id,
                DeploymentStatus::Error,
                Some("health wait timed out"),
            )
            .await
            .unwrap();

        let fetched = store.get(&deployment.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, DeploymentStatus::Error);
        assert_eq!(fetched.last_action.as_deref(), Some("health wait timed out"));
    }
}
