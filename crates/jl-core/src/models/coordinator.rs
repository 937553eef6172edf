use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CoordinatorStatus {
    Starting,
    Ready,
    Unready,
    Stopped,
}

impl CoordinatorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinatorStatus::Starting => "starting",
            CoordinatorStatus::Ready => "ready",
            CoordinatorStatus::Unready => "unready",
            CoordinatorStatus::Stopped => "stopped",
        }
    }
}

/// Admin login for the coordinator's web UI and management API.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl AdminCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for AdminCredentials {
    fn default() -> Self {
        Self::new("admin", "admin")
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorRecord {
    pub container_id: String,
    pub container_name: String,
    pub admin: AdminCredentials,
    pub status: CoordinatorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
    pub deployed_at: DateTime<Utc>,
}

impl CoordinatorRecord {
    pub fn new(
        container_id: String,
        container_name: String,
        admin: AdminCredentials,
        public_url: Option<String>,
    ) -> Self {
        Self {
            container_id,
            container_name,
            admin,
            status: CoordinatorStatus::Starting,
            public_url,
            plugins: Vec::new(),
            deployed_at: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == CoordinatorStatus::Ready
    }
}
