use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node label every worker is registered under.
pub const AGENT_LABEL: &str = "agent";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationStatus {
    Pending,
    Registered,
    Failed,
}

impl RegistrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Registered => "registered",
            RegistrationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Docker memory limit, e.g. `2g`.
    pub memory: String,
    /// Docker CPU quota, e.g. `2` or `1.5`.
    pub cpus: String,
}

impl ResourceLimits {
    pub fn new(memory: impl Into<String>, cpus: impl Into<String>) -> Self {
        Self {
            memory: memory.into(),
            cpus: cpus.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub index: u32,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub label: String,
    pub limits: ResourceLimits,
    pub registration: RegistrationStatus,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removal_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(index: u32, container_name: String, limits: ResourceLimits) -> Self {
        Self {
            index,
            container_name,
            container_id: None,
            label: AGENT_LABEL.to_string(),
            limits,
            registration: RegistrationStatus::Pending,
            removal_failed: false,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Jenkins node name; matches the container name so the coordinator
    /// reaches the worker by DNS on the shared network.
    pub fn node_name(&self) -> &str {
        &self.container_name
    }
}
