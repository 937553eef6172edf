use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSession {
    pub pid: u32,
    pub public_url: String,
    /// Where the auth token lives; the token itself is never stored in state.
    pub token_path: PathBuf,
    pub target_port: u16,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub running: bool,
    pub public_url: Option<String>,
}
