//! Deployment lifecycle: manifest rewriting, environment generation and the
//! orchestrating manager.

pub mod environment;
pub mod manager;
pub mod manifest;

pub use manager::{
    CreateParams, DeploymentDetail, DeploymentManager, DeploymentMetrics, PhaseEvent,
    ProgressSender, SyncReport,
};
