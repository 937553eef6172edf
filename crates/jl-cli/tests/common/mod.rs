// Compiled separately into each test binary, and each one uses only some
// of these helpers.
#![allow(dead_code)]

use std::path::PathBuf;

use jl_core::models::{
    AdminCredentials, ClusterState, CoordinatorRecord, CoordinatorStatus, KeyPair,
    RegistrationStatus, ResourceLimits, WorkerRecord,
};

pub fn worker(index: u32, registration: RegistrationStatus) -> WorkerRecord {
    let mut record = WorkerRecord::new(
        index,
        format!("jenkins-local-agent-{index}"),
        ResourceLimits::new("2g", "2"),
    );
    record.container_id = Some(format!("c{index}"));
    record.registration = registration;
    record
}

pub fn ready_coordinator(public_url: Option<&str>) -> CoordinatorRecord {
    let mut record = CoordinatorRecord::new(
        "c100".into(),
        "jenkins-local-master".into(),
        AdminCredentials::new("admin", "secret"),
        public_url.map(str::to_string),
    );
    record.status = CoordinatorStatus::Ready;
    record
}

pub fn provisioned_state() -> ClusterState {
    ClusterState {
        network_id: Some("net0001".into()),
        volume_id: Some("jenkins-local-data".into()),
        key_pair: Some(KeyPair {
            private_key_path: PathBuf::from("/home/ci/.jenkins-local/ssh/id_rsa"),
            public_key_path: PathBuf::from("/home/ci/.jenkins-local/ssh/id_rsa.pub"),
            fingerprint: "SHA256:abc".into(),
        }),
        ..ClusterState::default()
    }
}
