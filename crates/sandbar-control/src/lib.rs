//! Sandbar Control Service
//!
//! Control plane for ephemeral multi-tenant test deployments. Each tester
//! owns a small number of isolated environments, every environment owns a
//! fixed-width port block, a private source tree materialized from a shared
//! git mirror cache, a container group and (optionally) a reverse-proxy
//! virtual host.
//!
//! # Architecture
//!
//! The service is responsible for:
//!
//! - **Lifecycle orchestration**: create, update, stop/start/restart and
//!   delete deployments through a fixed, ordered bring-up sequence
//! - **State management**: a persistent store holding deployment records
//!   and port allocations, mutated atomically
//! - **Source caching**: shared bare-ish mirrors with per-URL locking, TTL
//!   freshness and self-healing updates
//! - **Routing**: per-deployment nginx virtual hosts with basic-auth,
//!   reconciled against the live deployment set
//! - **API surface**: HTTP endpoints for deployment management, version
//!   discovery and drift-correction sweeps
//!
//! # State Machine
//!
//! ```text
//! Creating ──▶ Running ◀──▶ Stopped
//!     │           │
//!     ▼           ▼
//!   Error ◀── Updating ──▶ Running
//! ```
//!
//! Any state can be deleted; deletion is terminal and frees the port block.

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod api;
pub mod compose;
pub mod config;
pub mod deployment;
pub mod error;
pub mod gitcache;
pub mod process;
pub mod proxy;
pub mod store;
pub mod types;
pub mod versions;

// Re-export commonly used types at the crate root
pub use compose::ContainerOrchestrator;
pub use config::ControlConfig;
pub use deployment::{CreateParams, DeploymentManager};
pub use error::{ControlError, ControlResult};
pub use gitcache::GitCacheManager;
pub use process::{Cmd, CommandRunner};
pub use proxy::ProxyReconciler;
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, SqliteStore};
pub use types::{Deployment, DeploymentId, DeploymentStatus, Environment, PortAllocation};
pub use versions::VersionCatalog;
