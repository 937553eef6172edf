use std::fmt;

use serde::{Deserialize, Serialize};

use super::coordinator::CoordinatorRecord;
use super::keys::KeyPair;
use super::tunnel::TunnelSession;
use super::worker::WorkerRecord;

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Steps of the setup state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SetupStep {
    Init,
    NetworkVolume,
    Keys,
    Tunnel,
    CoordinatorDeploy,
    CoordinatorReady,
    Plugins,
    ImageCheck,
    Workers,
    Done,
}

impl SetupStep {
    pub const ALL: [SetupStep; 10] = [
        SetupStep::Init,
        SetupStep::NetworkVolume,
        SetupStep::Keys,
        SetupStep::Tunnel,
        SetupStep::CoordinatorDeploy,
        SetupStep::CoordinatorReady,
        SetupStep::Plugins,
        SetupStep::ImageCheck,
        SetupStep::Workers,
        SetupStep::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SetupStep::Init => "INIT",
            SetupStep::NetworkVolume => "NETWORK/VOLUME",
            SetupStep::Keys => "KEYS",
            SetupStep::Tunnel => "TUNNEL",
            SetupStep::CoordinatorDeploy => "COORDINATOR_DEPLOY",
            SetupStep::CoordinatorReady => "COORDINATOR_READY",
            SetupStep::Plugins => "PLUGINS",
            SetupStep::ImageCheck => "IMAGE_CHECK",
            SetupStep::Workers => "WORKERS",
            SetupStep::Done => "DONE",
        }
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted inventory of everything the tool has provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<KeyPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorRecord>,
    #[serde(default)]
    pub workers: Vec<WorkerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<SetupStep>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            network_id: None,
            volume_id: None,
            key_pair: None,
            tunnel: None,
            coordinator: None,
            workers: Vec::new(),
            last_completed_step: None,
        }
    }
}

impl ClusterState {
    pub fn worker(&self, index: u32) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| w.index == index)
    }

    pub fn worker_mut(&mut self, index: u32) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|w| w.index == index)
    }

    /// The `count` lowest indices not held by any worker record.
    pub fn free_indices(&self, count: usize) -> Vec<u32> {
        let mut free = Vec::with_capacity(count);
        let mut candidate = 0u32;
        while free.len() < count {
            if self.worker(candidate).is_none() {
                free.push(candidate);
            }
            candidate += 1;
        }
        free
    }

    /// Insert or replace a worker record, keeping the list ordered by index.
    pub fn upsert_worker(&mut self, record: WorkerRecord) {
        match self.workers.iter_mut().find(|w| w.index == record.index) {
            Some(existing) => *existing = record,
            None => {
                self.workers.push(record);
                self.workers.sort_by_key(|w| w.index);
            }
        }
    }

    pub fn remove_worker(&mut self, index: u32) -> Option<WorkerRecord> {
        let position = self.workers.iter().position(|w| w.index == index)?;
        Some(self.workers.remove(position))
    }

    pub fn has_shared_resources(&self) -> bool {
        self.network_id.is_some() && self.volume_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RegistrationStatus, ResourceLimits};

    fn worker(index: u32) -> WorkerRecord {
        WorkerRecord::new(
            index,
            format!("jenkins-local-agent-{index}"),
            ResourceLimits::new("2g", "2"),
        )
    }

    #[test]
    fn free_indices_fill_gaps_first() {
        let mut state = ClusterState::default();
        state.upsert_worker(worker(0));
        state.upsert_worker(worker(2));
        assert_eq!(state.free_indices(3), vec![1, 3, 4]);
    }

    #[test]
    fn upsert_keeps_order_and_replaces() {
        let mut state = ClusterState::default();
        state.upsert_worker(worker(2));
        state.upsert_worker(worker(0));
        let mut updated = worker(2);
        updated.registration = RegistrationStatus::Registered;
        state.upsert_worker(updated);

        let indices: Vec<u32> = state.workers.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(
            state.worker(2).unwrap().registration,
            RegistrationStatus::Registered
        );
    }

    #[test]
    fn step_order_matches_pipeline() {
        assert!(SetupStep::Tunnel < SetupStep::CoordinatorDeploy);
        assert!(SetupStep::Plugins < SetupStep::Workers);
        assert_eq!(SetupStep::NetworkVolume.to_string(), "NETWORK/VOLUME");
    }

    #[test]
    fn state_uses_camel_case() {
        let mut state = ClusterState::default();
        state.network_id = Some("abc".into());
        state.last_completed_step = Some(SetupStep::CoordinatorReady);
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"schemaVersion\":1"));
        assert!(json.contains("\"networkId\":\"abc\""));
        assert!(json.contains("\"lastCompletedStep\":\"coordinatorReady\""));
        assert!(!json.contains("network_id"));
    }
}
