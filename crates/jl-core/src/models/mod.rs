pub mod batch;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod keys;
pub mod plugin;
pub mod tunnel;
pub mod worker;

pub use batch::{BatchOutcome, ItemFailure};
pub use cluster::{ClusterState, SetupStep, STATE_SCHEMA_VERSION};
pub use config::{ClusterConfig, ClusterPaths};
pub use coordinator::{AdminCredentials, CoordinatorRecord, CoordinatorStatus};
pub use keys::KeyPair;
pub use plugin::{InstallResult, PluginSpec, REQUIRED_PLUGINS};
pub use tunnel::{TunnelSession, TunnelStatus};
pub use worker::{RegistrationStatus, ResourceLimits, WorkerRecord, AGENT_LABEL};
