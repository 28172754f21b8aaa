//! Deployment persistence and port allocation.
//!
//! The store owns the only two resources mutated by concurrent operations:
//! deployment records and the port range. Port allocation and the owning
//! record's persistence happen atomically in one transaction, so a port can
//! never leak without a deployment that owns it.

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::config::PortsConfig;
use crate::error::ControlResult;
use crate::types::{Deployment, DeploymentId, DeploymentStatus, Environment, PortAllocation};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Filter for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by tester email.
    pub tester_email: Option<String>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Filter by environment.
    pub environment: Option<Environment>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create an empty filter matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by tester email.
    #[must_use]
    pub fn with_tester(mut self, email: impl Into<String>) -> Self {
        self.tester_email = Some(email.into());
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by environment.
    #[must_use]
    pub const fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Limit the number of results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` results.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Persistent CRUD over deployment records plus the port-range allocator.
#[async_trait]
pub trait DeploymentStore: Send + Sync + std::fmt::Debug {
    /// Insert or update a deployment record.
    async fn save(&self, deployment: &Deployment) -> ControlResult<()>;

    /// Fetch a deployment by ID.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<Deployment>>;

    /// List deployments matching a filter, newest first.
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<Deployment>>;

    /// Delete a deployment record and its port allocation together.
    ///
    /// Fails with `NotFound` if no such deployment exists.
    async fn delete(&self, id: &DeploymentId) -> ControlResult<()>;

    /// Count deployments owned by a tester.
    async fn count_for_tester(&self, email: &str) -> ControlResult<u32>;

    /// Update only a deployment's status and diagnostic, refreshing
    /// `last_updated`.
    async fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        last_action: Option<&str>,
    ) -> ControlResult<()>;

    /// Allocate the lowest free port block and persist `deployment` with
    /// `port_base` set, atomically. Returns the allocated base.
    ///
    /// On `ResourceExhausted` no record is persisted.
    async fn allocate_port(&self, deployment: &Deployment, increment: u16) -> ControlResult<u16>;

    /// List all current port allocations, lowest base first.
    async fn list_allocations(&self) -> ControlResult<Vec<PortAllocation>>;
}

/// First-fit scan for a free block of width `increment`.
///
/// `allocated` must be sorted ascending and confined to the configured range.
/// Tries, in order: the gap before the first allocation, the first internal
/// gap wide enough, the slot after the last allocation. Returns `None` when
/// the range is exhausted.
pub(crate) fn find_free_base(allocated: &[u16], ports: &PortsConfig) -> Option<u16> {
    // Sums are computed in u32 so a range running up to 65535 cannot
    // overflow the port type.
    let increment = u32::from(ports.increment);
    let range_end = u32::from(ports.range_end);

    let first = match allocated.first() {
        None => {
            return (u32::from(ports.range_start) + increment <= range_end)
                .then_some(ports.range_start);
        }
        Some(first) => *first,
    };

    if u32::from(first - ports.range_start) >= increment {
        return Some(ports.range_start);
    }

    for pair in allocated.windows(2) {
        let gap_start = u32::from(pair[0]) + increment;
        if u32::from(pair[1]) >= gap_start + increment {
            return u16::try_from(gap_start).ok();
        }
    }

    // `allocated` is non-empty here.
    let last = *allocated.last()?;
    let candidate = u32::from(last) + increment;
    if candidate + increment <= range_end {
        u16::try_from(candidate).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> PortsConfig {
        PortsConfig {
            range_start: 18000,
            range_end: 19000,
            increment: 100,
        }
    }

    #[test]
    fn empty_range_starts_at_range_start() {
        assert_eq!(find_free_base(&[], &ports()), Some(18000));
    }

    #[test]
    fn sequential_allocation_is_injective() {
        let mut allocated = Vec::new();
        for k in 0..10u16 {
            let base = find_free_base(&allocated, &ports()).unwrap();
            assert_eq!(base, 18000 + k * 100);
            allocated.push(base);
        }
    }

    #[test]
    fn gap_before_first_is_preferred() {
        assert_eq!(find_free_base(&[18100, 18200], &ports()), Some(18000));
    }

    #[test]
    fn first_internal_gap_wins() {
        // Free slots at 18100 and 18400; first fit takes 18100.
        assert_eq!(
            find_free_base(&[18000, 18200, 18300, 18500], &ports()),
            Some(18100)
        );
    }

    #[test]
    fn slot_after_last_still_fits() {
        assert_eq!(find_free_base(&[18000, 18100], &ports()), Some(18200));
    }

    #[test]
    fn full_range_is_exhausted() {
        let allocated: Vec<u16> = (0..10).map(|k| 18000 + k * 100).collect();
        assert_eq!(find_free_base(&allocated, &ports()), None);
    }

    #[test]
    fn last_slot_respects_range_end() {
        let allocated = vec![18800];
        assert_eq!(find_free_base(&allocated, &ports()), Some(18000));

        let tight = PortsConfig {
            range_start: 18000,
            range_end: 18200,
            increment: 100,
        };
        assert_eq!(find_free_base(&[18000], &tight), Some(18100));
        assert_eq!(find_free_base(&[18000, 18100], &tight), None);
    }

    #[test]
    fn range_at_the_top_of_port_space() {
        let high = PortsConfig {
            range_start: 65000,
            range_end: 65535,
            increment: 500,
        };
        assert_eq!(find_free_base(&[], &high), Some(65000));
        assert_eq!(find_free_base(&[65000], &high), None);

        let narrow = PortsConfig {
            range_start: 65500,
            range_end: 65535,
            increment: 100,
        };
        assert_eq!(find_free_base(&[], &narrow), None);
    }
}
