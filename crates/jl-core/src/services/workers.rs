use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::error::{ClusterError, Result};
use crate::models::{
    AdminCredentials, BatchOutcome, ClusterConfig, ClusterPaths, RegistrationStatus,
    ResourceLimits, WorkerRecord,
};

use super::jenkins::{ManagementApi, NodeSpec, SSH_CREDENTIAL_ID, SSH_USERNAME};
use super::poll::{retry_transient, RetryPolicy};
use super::runtime::{
    remove_leftover, ContainerRuntime, ContainerSpec, ContainerState, Mount, ROLE_LABEL,
};
use super::state::StateStore;

const AGENT_DOCKERFILE: &str = r#"FROM jenkins/ssh-agent:latest-jdk17

USER root
RUN apt-get update \
    && apt-get install -y --no-install-recommends docker.io git curl \
    && rm -rf /var/lib/apt/lists/*

COPY boot.sh /usr/local/bin/jenkins-local-boot.sh
RUN chmod 755 /usr/local/bin/jenkins-local-boot.sh

ENTRYPOINT ["/usr/local/bin/jenkins-local-boot.sh"]
"#;

const AGENT_BOOT_SCRIPT: &str = r#"#!/bin/sh
set -e

# Jobs talk to the host engine through the mounted socket.
if [ -S /var/run/docker.sock ]; then
    chmod 666 /var/run/docker.sock 2>/dev/null || true
fi

mkdir -p /home/jenkins/agent
chown jenkins:jenkins /home/jenkins/agent

exec setup-sshd "$@"
"#;

const AGENT_ROLE: &str = "agent";
const SHARED_MOUNT: &str = "/var/jenkins_shared";
const SSH_PORT: u16 = 22;
const EXECUTORS: u32 = 2;
/// Used when the host has no `docker` group entry.
const FALLBACK_DOCKER_GID: &str = "999";

pub struct WorkerController {
    runtime: Arc<dyn ContainerRuntime>,
    api: Arc<dyn ManagementApi>,
    store: Arc<StateStore>,
    config: Arc<ClusterConfig>,
    paths: ClusterPaths,
    retry: RetryPolicy,
}

/// Result of launching one reserved index.
type Launch = (u32, Result<String>);

impl WorkerController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        api: Arc<dyn ManagementApi>,
        store: Arc<StateStore>,
        config: Arc<ClusterConfig>,
        paths: ClusterPaths,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runtime,
            api,
            store,
            config,
            paths,
            retry,
        }
    }

    /// Build the worker image from the embedded recipe unless it exists.
    /// Returns whether a build happened.
    pub async fn ensure_image(&self) -> Result<bool> {
        let image = &self.config.agent.image;
        if self.runtime.image_exists(image).await? {
            tracing::debug!(%image, "worker image present");
            return Ok(false);
        }
        let dir = self.paths.agent_image_dir();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("Dockerfile"), AGENT_DOCKERFILE).await?;
        tokio::fs::write(dir.join("boot.sh"), AGENT_BOOT_SCRIPT).await?;
        tracing::info!(%image, "building worker image");
        self.runtime.build_image(image, &dir).await?;
        Ok(true)
    }

    /// Grow the pool to `count` workers and register every worker that is
    /// not yet registered. Never shrinks the pool.
    ///
    /// `succeeded` holds every worker record after the run, including ones
    /// whose registration failed; `failed` holds indices whose container
    /// could not be launched (their reservation is dropped).
    pub async fn deploy(
        &self,
        count: usize,
        limits: &ResourceLimits,
        admin: &AdminCredentials,
    ) -> Result<BatchOutcome<WorkerRecord>> {
        let state = self.store.load().await?;
        if !state.has_shared_resources() {
            return Err(ClusterError::PrerequisiteMissing(
                "shared network and volume do not exist".into(),
            ));
        }
        let key_pair = state
            .key_pair
            .ok_or_else(|| ClusterError::KeyNotFound(self.paths.ssh_dir().join("id_rsa")))?;
        let public_key = tokio::fs::read_to_string(&key_pair.public_key_path)
            .await
            .map_err(|_| ClusterError::KeyNotFound(key_pair.public_key_path.clone()))?;
        let public_key = public_key.trim().to_string();

        let to_launch = self.reserve(count, limits).await?;
        if let Err(e) = self.clear_leftovers(&to_launch).await {
            self.store
                .update(|s| s.workers.retain(|w| !to_launch.contains(&w.index)))
                .await?;
            return Err(e);
        }
        let docker_gid = docker_group_id();

        let mut outcome: BatchOutcome<WorkerRecord> = BatchOutcome::default();
        let launches: Vec<Launch> = stream::iter(to_launch)
            .map(|index| {
                let public_key = public_key.as_str();
                let docker_gid = docker_gid.as_str();
                async move { (index, self.launch(index, limits, public_key, docker_gid).await) }
            })
            .buffer_unordered(self.config.agent.max_parallel)
            .collect()
            .await;

        for (index, result) in launches {
            if let Err(e) = result {
                tracing::warn!(index, error = %e, "worker launch failed");
                self.store.update(|s| {
                    s.remove_worker(index);
                }).await?;
                outcome.record_failure(format!("worker {index}"), e);
            }
        }

        self.register_pending(admin, &key_pair.private_key_path).await?;
        outcome.succeeded = self.store.load().await?.workers;
        Ok(outcome)
    }

    /// Reserve indices for missing workers and return every index that
    /// still needs a container, including reservations left by an
    /// interrupted run.
    async fn reserve(&self, count: usize, limits: &ResourceLimits) -> Result<Vec<u32>> {
        let agent = self.config.agent.clone();
        let limits = limits.clone();
        self.store
            .try_update(move |s| {
                let missing = count.saturating_sub(s.workers.len());
                for index in s.free_indices(missing) {
                    s.upsert_worker(WorkerRecord::new(
                        index,
                        agent.container_name(index),
                        limits.clone(),
                    ));
                }
                Ok(s.workers
                    .iter()
                    .filter(|w| w.container_id.is_none())
                    .map(|w| w.index)
                    .collect())
            })
            .await
    }

    /// A container may survive from a run that died before recording it.
    /// Ours are replaced; any other container under a worker name is a
    /// conflict and nothing gets launched.
    async fn clear_leftovers(&self, indices: &[u32]) -> Result<()> {
        for &index in indices {
            let name = self.config.agent.container_name(index);
            remove_leftover(self.runtime.as_ref(), &name, AGENT_ROLE).await?;
        }
        Ok(())
    }

    async fn launch(
        &self,
        index: u32,
        limits: &ResourceLimits,
        public_key: &str,
        docker_gid: &str,
    ) -> Result<String> {
        let name = self.config.agent.container_name(index);
        let spec = self.container_spec(index, &name, limits, public_key, docker_gid);
        let id = self.runtime.run(&spec).await?;
        tracing::info!(index, container = %name, %id, "worker container started");

        let recorded = id.clone();
        self.store
            .update(|s| {
                if let Some(w) = s.worker_mut(index) {
                    w.container_id = Some(recorded);
                }
            })
            .await?;
        Ok(id)
    }

    fn container_spec(
        &self,
        index: u32,
        name: &str,
        limits: &ResourceLimits,
        public_key: &str,
        docker_gid: &str,
    ) -> ContainerSpec {
        let agent = &self.config.agent;
        let mut spec = ContainerSpec::new(name, agent.image.clone());
        spec.network = Some(self.config.network.clone());
        spec.mounts = vec![
            Mount::new(agent.docker_socket.clone(), "/var/run/docker.sock"),
            Mount::new(self.config.volume.clone(), SHARED_MOUNT).read_only(),
        ];
        spec.env = vec![("JENKINS_AGENT_SSH_PUBKEY".into(), public_key.to_string())];
        spec.labels = vec![
            (ROLE_LABEL.into(), AGENT_ROLE.into()),
            ("jenkins-local.index".into(), index.to_string()),
        ];
        spec.memory = Some(limits.memory.clone());
        spec.cpus = Some(limits.cpus.clone());
        spec.group_add = vec![docker_gid.to_string()];
        spec.restart_policy = Some("unless-stopped".into());
        spec
    }

    async fn ensure_credential(&self, admin: &AdminCredentials, private_key_path: &std::path::Path) -> Result<()> {
        let exists = retry_transient(&self.retry, "check SSH credential", || {
            self.api.credential_exists(admin, SSH_CREDENTIAL_ID)
        })
        .await?;
        if exists {
            return Ok(());
        }
        let private_key = tokio::fs::read_to_string(private_key_path)
            .await
            .map_err(|_| ClusterError::KeyNotFound(private_key_path.to_path_buf()))?;
        retry_transient(&self.retry, "create SSH credential", || {
            self.api
                .create_ssh_credential(admin, SSH_CREDENTIAL_ID, SSH_USERNAME, &private_key)
        })
        .await?;
        tracing::info!(id = SSH_CREDENTIAL_ID, "created SSH credential");
        Ok(())
    }

    /// Register every launched worker that is not registered yet. A failed
    /// registration is recorded on the worker, not returned.
    async fn register_pending(&self, admin: &AdminCredentials, private_key_path: &std::path::Path) -> Result<()> {
        let pending: Vec<WorkerRecord> = self
            .store
            .load()
            .await?
            .workers
            .into_iter()
            .filter(|w| w.container_id.is_some() && w.registration != RegistrationStatus::Registered)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.ensure_credential(admin, private_key_path).await {
            tracing::warn!(error = %e, "could not set up SSH credential, workers left unregistered");
            let message = e.to_string();
            self.store
                .update(|s| {
                    for w in s.workers.iter_mut() {
                        if pending.iter().any(|p| p.index == w.index) {
                            w.registration = RegistrationStatus::Failed;
                            w.last_error = Some(message.clone());
                        }
                    }
                })
                .await?;
            return Ok(());
        }

        let results: Vec<(u32, Result<()>)> = stream::iter(pending)
            .map(|worker| async move {
                let result = self.register_node(admin, &worker).await;
                (worker.index, result)
            })
            .buffer_unordered(self.config.agent.max_parallel)
            .collect()
            .await;

        for (index, result) in results {
            self.record_registration(index, result).await?;
        }
        Ok(())
    }

    async fn register_node(&self, admin: &AdminCredentials, worker: &WorkerRecord) -> Result<()> {
        let node = NodeSpec {
            name: worker.node_name().to_string(),
            host: worker.container_name.clone(),
            port: SSH_PORT,
            label: worker.label.clone(),
            remote_fs: self.config.agent.remote_fs.clone(),
            executors: EXECUTORS,
            credential_id: SSH_CREDENTIAL_ID.into(),
        };
        let exists = retry_transient(&self.retry, "look up node", || {
            self.api.node_exists(admin, &node.name)
        })
        .await?;
        if !exists {
            retry_transient(&self.retry, "register node", || self.api.create_node(admin, &node)).await?;
        }
        Ok(())
    }

    async fn record_registration(&self, index: u32, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => tracing::info!(index, "worker registered"),
            Err(e) => tracing::warn!(index, error = %e, "worker registration failed"),
        }
        self.store
            .update(|s| {
                if let Some(w) = s.worker_mut(index) {
                    match result {
                        Ok(()) => {
                            w.registration = RegistrationStatus::Registered;
                            w.last_error = None;
                        }
                        Err(e) => {
                            w.registration = RegistrationStatus::Failed;
                            w.last_error = Some(e.to_string());
                        }
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Retry registration of one worker. Uses the recorded coordinator admin
    /// unless `admin` is given.
    pub async fn register(&self, index: u32, admin: Option<&AdminCredentials>) -> Result<WorkerRecord> {
        let state = self.store.load().await?;
        let worker = state.worker(index).cloned().ok_or(ClusterError::WorkerNotFound(index))?;
        if worker.container_id.is_none() {
            return Err(ClusterError::InvalidInput(format!(
                "worker {index} has no container; run `jenkins-local agent deploy` first"
            )));
        }
        let admin = match admin {
            Some(a) => a.clone(),
            None => state
                .coordinator
                .as_ref()
                .map(|c| c.admin.clone())
                .ok_or(ClusterError::CoordinatorNotDeployed)?,
        };
        let key_pair = state
            .key_pair
            .ok_or_else(|| ClusterError::KeyNotFound(self.paths.ssh_dir().join("id_rsa")))?;

        let result = match self.ensure_credential(&admin, &key_pair.private_key_path).await {
            Ok(()) => self.register_node(&admin, &worker).await,
            Err(e) => Err(e),
        };
        let failure = result.as_ref().err().map(|e| e.to_string());
        self.record_registration(index, result).await?;
        if let Some(message) = failure {
            return Err(ClusterError::Api(format!("worker {index} registration failed: {message}")));
        }
        self.store
            .load()
            .await?
            .worker(index)
            .cloned()
            .ok_or(ClusterError::WorkerNotFound(index))
    }

    pub async fn list(&self) -> Result<Vec<WorkerRecord>> {
        Ok(self.store.load().await?.workers)
    }

    /// Live container state for each recorded worker.
    pub async fn container_states(&self) -> Result<Vec<(u32, Option<ContainerState>)>> {
        let workers = self.list().await?;
        let mut states = Vec::with_capacity(workers.len());
        for w in workers {
            states.push((w.index, self.runtime.state(&w.container_name).await?));
        }
        Ok(states)
    }

    /// Logs of one worker, or of all of them in index order.
    pub async fn logs(&self, index: Option<u32>, tail: Option<usize>) -> Result<Vec<(u32, String)>> {
        let workers = self.list().await?;
        let selected: Vec<WorkerRecord> = match index {
            Some(i) => vec![workers
                .into_iter()
                .find(|w| w.index == i)
                .ok_or(ClusterError::WorkerNotFound(i))?],
            None => workers,
        };
        let mut logs = Vec::with_capacity(selected.len());
        for w in selected {
            logs.push((w.index, self.runtime.logs(&w.container_name, tail).await?));
        }
        Ok(logs)
    }

    /// Deregister, then remove the container, then drop the record. If any
    /// step fails the record stays, flagged `removal_failed`. A worker whose
    /// node is already gone falls back to `pending` so the next deploy
    /// registers it again.
    pub async fn remove(&self, index: u32) -> Result<()> {
        let state = self.store.load().await?;
        let worker = state.worker(index).cloned().ok_or(ClusterError::WorkerNotFound(index))?;
        let admin = state.coordinator.as_ref().map(|c| c.admin.clone());

        let mut deregistered = false;
        let result = match self.deregister(&worker, admin.as_ref()).await {
            Ok(done) => {
                deregistered = done;
                self.runtime.remove(&worker.container_name).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.store.update(|s| {
                    s.remove_worker(index);
                }).await?;
                tracing::info!(index, container = %worker.container_name, "worker removed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .update(|s| {
                        if let Some(w) = s.worker_mut(index) {
                            w.removal_failed = true;
                            w.last_error = Some(message);
                            if deregistered {
                                w.registration = RegistrationStatus::Pending;
                            }
                        }
                    })
                    .await?;
                Err(e)
            }
        }
    }

    /// Delete the worker's node. Returns whether a coordinator was asked.
    async fn deregister(&self, worker: &WorkerRecord, admin: Option<&AdminCredentials>) -> Result<bool> {
        let Some(admin) = admin else {
            return Ok(false);
        };
        retry_transient(&self.retry, "deregister node", || {
            self.api.delete_node(admin, worker.node_name())
        })
        .await?;
        Ok(true)
    }

    /// Remove every worker, collecting per-index failures.
    pub async fn remove_all(&self) -> Result<BatchOutcome<u32>> {
        let indices: Vec<u32> = self.list().await?.iter().map(|w| w.index).collect();
        let mut results: Vec<(u32, Result<()>)> = stream::iter(indices)
            .map(|index| async move { (index, self.remove(index).await) })
            .buffer_unordered(self.config.agent.max_parallel)
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        let mut outcome = BatchOutcome::default();
        for (index, result) in results {
            match result {
                Ok(()) => outcome.succeeded.push(index),
                Err(e) => outcome.record_failure(format!("worker {index}"), e),
            }
        }
        Ok(outcome)
    }
}

/// Group id of `docker` in an `/etc/group`-formatted listing.
pub fn parse_group_id(group_file: &str, group: &str) -> Option<String> {
    group_file.lines().find_map(|line| {
        let mut fields = line.split(':');
        (fields.next()? == group)
            .then(|| fields.nth(1))
            .flatten()
            .filter(|gid| !gid.is_empty())
            .map(str::to_string)
    })
}

fn docker_group_id() -> String {
    if cfg!(target_os = "macos") {
        return "20".into();
    }
    std::fs::read_to_string("/etc/group")
        .ok()
        .and_then(|contents| parse_group_id(&contents, "docker"))
        .unwrap_or_else(|| FALLBACK_DOCKER_GID.into())
}
