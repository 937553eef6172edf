use std::sync::Arc;

use regex::Regex;

use crate::error::{ClusterError, Result};
use crate::models::{
    AdminCredentials, BatchOutcome, ClusterConfig, ClusterPaths, ClusterState, CoordinatorRecord,
    InstallResult, RegistrationStatus, ResourceLimits, SetupStep, TunnelStatus, WorkerRecord,
    REQUIRED_PLUGINS,
};

use super::coordinator::CoordinatorController;
use super::jenkins::{JenkinsClient, ManagementApi};
use super::keys::KeyManager;
use super::ngrok::{NgrokCli, TunnelBackend};
use super::plugins::{PluginInstaller, PluginTimeouts};
use super::poll::RetryPolicy;
use super::provisioner::ResourceProvisioner;
use super::runtime::{ContainerRuntime, ContainerState, DockerCli};
use super::state::StateStore;
use super::tunnel::TunnelManager;
use super::workers::WorkerController;

pub const MAX_AGENTS: usize = 32;

/// Validate a Docker memory limit such as `512m` or `2g`.
pub fn validate_memory(memory: &str) -> Result<()> {
    let re = Regex::new(r"^\d+[bkmg]$")
        .map_err(|e| ClusterError::InvalidInput(format!("memory pattern: {e}")))?;
    if !re.is_match(memory) {
        return Err(ClusterError::InvalidInput(format!(
            "memory '{memory}' must be a number followed by b, k, m or g"
        )));
    }
    Ok(())
}

/// Validate a Docker CPU quota: a positive decimal.
pub fn validate_cpus(cpus: &str) -> Result<()> {
    match cpus.parse::<f64>() {
        Ok(value) if value > 0.0 && value.is_finite() => Ok(()),
        _ => Err(ClusterError::InvalidInput(format!(
            "cpus '{cpus}' must be a positive number"
        ))),
    }
}

/// Validated worker resource limits.
pub fn worker_limits(memory: &str, cpus: &str) -> Result<ResourceLimits> {
    validate_memory(memory)?;
    validate_cpus(cpus)?;
    Ok(ResourceLimits::new(memory, cpus))
}

pub fn validate_agent_count(count: usize) -> Result<()> {
    if count > MAX_AGENTS {
        return Err(ClusterError::InvalidInput(format!(
            "at most {MAX_AGENTS} agents are supported, got {count}"
        )));
    }
    Ok(())
}

/// Options for one `setup` run.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub agents: usize,
    pub limits: ResourceLimits,
    pub admin: AdminCredentials,
    pub public: bool,
}

impl SetupOptions {
    pub fn validate(&self) -> Result<()> {
        validate_agent_count(self.agents)?;
        validate_memory(&self.limits.memory)?;
        validate_cpus(&self.limits.cpus)?;
        if self.admin.username.trim().is_empty() || self.admin.password.is_empty() {
            return Err(ClusterError::InvalidInput(
                "admin username and password must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SetupReport {
    pub coordinator: CoordinatorRecord,
    pub workers: Vec<WorkerRecord>,
    pub plugins: Option<InstallResult>,
    pub public_url: Option<String>,
    /// Steps found already complete in the recorded state.
    pub skipped: Vec<SetupStep>,
}

impl SetupReport {
    pub fn failed_registrations(&self) -> Vec<u32> {
        self.workers
            .iter()
            .filter(|w| w.registration == RegistrationStatus::Failed)
            .map(|w| w.index)
            .collect()
    }
}

/// Aggregate view for `status`.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub state: ClusterState,
    pub runtime_reachable: bool,
    pub coordinator_container: Option<ContainerState>,
    pub worker_containers: Vec<(u32, Option<ContainerState>)>,
    pub tunnel: TunnelStatus,
}

/// Every component, wired against one state store.
pub struct Orchestrator {
    pub config: Arc<ClusterConfig>,
    pub paths: ClusterPaths,
    pub store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    api: Arc<dyn ManagementApi>,
    pub provisioner: ResourceProvisioner,
    pub keys: KeyManager,
    pub tunnel: TunnelManager,
    pub coordinator: Arc<CoordinatorController>,
    pub plugins: PluginInstaller,
    pub workers: WorkerController,
}

impl Orchestrator {
    pub fn new(
        config: ClusterConfig,
        paths: ClusterPaths,
        runtime: Arc<dyn ContainerRuntime>,
        api: Arc<dyn ManagementApi>,
        tunnel_backend: Arc<dyn TunnelBackend>,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(StateStore::new(&paths));
        let retry = RetryPolicy::from(&config.retry);

        let coordinator = Arc::new(CoordinatorController::new(
            runtime.clone(),
            api.clone(),
            store.clone(),
            config.clone(),
            paths.clone(),
        ));
        let plugins = PluginInstaller::new(
            api.clone(),
            coordinator.clone(),
            store.clone(),
            retry,
            PluginTimeouts {
                install: config.timeouts.plugin_install(),
                restart_down: config.timeouts.restart_down(),
                readiness: config.timeouts.readiness(),
            },
        );
        Self {
            provisioner: ResourceProvisioner::new(
                runtime.clone(),
                store.clone(),
                config.clone(),
                paths.clone(),
            ),
            keys: KeyManager::new(store.clone(), paths.clone()),
            tunnel: TunnelManager::new(
                tunnel_backend,
                store.clone(),
                paths.clone(),
                config.timeouts.tunnel(),
            ),
            workers: WorkerController::new(
                runtime.clone(),
                api.clone(),
                store.clone(),
                config.clone(),
                paths.clone(),
                retry,
            ),
            coordinator,
            plugins,
            runtime,
            api,
            store,
            paths,
            config,
        }
    }

    /// Wire the real Docker, Jenkins and ngrok adapters.
    pub fn with_defaults(config: ClusterConfig, paths: ClusterPaths) -> Result<Self> {
        let api = JenkinsClient::new(config.coordinator.local_url())?;
        let tunnel = NgrokCli::new(config.tunnel.binary.clone(), config.tunnel.api_url.clone())?;
        Ok(Self::new(
            config,
            paths,
            Arc::new(DockerCli::new()),
            Arc::new(api),
            Arc::new(tunnel),
        ))
    }

    async fn checkpoint(&self, step: SetupStep) -> Result<()> {
        self.store
            .update(|s| s.last_completed_step = Some(step))
            .await?;
        tracing::info!(step = %step, "setup step complete");
        Ok(())
    }

    /// Run the setup pipeline. Completed steps are detected from the
    /// recorded state and skipped; a failure stops the pipeline and is
    /// returned tagged with its step.
    pub async fn setup(&self, options: &SetupOptions) -> Result<SetupReport> {
        let tag = |step: SetupStep| move |e: ClusterError| ClusterError::SetupStep {
            step,
            source: Box::new(e),
        };
        let mut skipped = Vec::new();

        // INIT: nothing is created until these hold.
        options.validate().map_err(tag(SetupStep::Init))?;
        self.runtime.ping().await.map_err(tag(SetupStep::Init))?;
        if options.public && !self.tunnel.is_authenticated() {
            return Err(tag(SetupStep::Tunnel)(ClusterError::TunnelNotAuthenticated));
        }
        self.checkpoint(SetupStep::Init).await?;

        let before = self.store.load().await?;
        if before.has_shared_resources() {
            skipped.push(SetupStep::NetworkVolume);
        }
        self.provisioner
            .init()
            .await
            .map_err(tag(SetupStep::NetworkVolume))?;
        self.checkpoint(SetupStep::NetworkVolume).await?;

        if before.key_pair.is_some() {
            skipped.push(SetupStep::Keys);
        }
        self.keys.ensure().await.map_err(tag(SetupStep::Keys))?;
        self.checkpoint(SetupStep::Keys).await?;

        let public_url = if options.public {
            let url = self
                .tunnel
                .start(self.config.coordinator.http_port)
                .await
                .map_err(tag(SetupStep::Tunnel))?;
            self.checkpoint(SetupStep::Tunnel).await?;
            Some(url)
        } else {
            None
        };

        let deployed = before.coordinator.is_some()
            && self
                .coordinator
                .is_running()
                .await
                .map_err(tag(SetupStep::CoordinatorDeploy))?;
        if deployed {
            skipped.push(SetupStep::CoordinatorDeploy);
        } else {
            self.coordinator
                .deploy(&options.admin, public_url.as_deref())
                .await
                .map_err(tag(SetupStep::CoordinatorDeploy))?;
        }
        self.checkpoint(SetupStep::CoordinatorDeploy).await?;

        let current = self.coordinator.record().await.map_err(tag(SetupStep::CoordinatorReady))?;
        if current.is_ready() && self.api.is_up().await {
            skipped.push(SetupStep::CoordinatorReady);
        } else {
            self.coordinator
                .wait_ready(self.config.timeouts.readiness())
                .await
                .map_err(tag(SetupStep::CoordinatorReady))?;
        }
        // A coordinator that survived from an earlier run may know an old URL.
        if let Some(url) = &public_url {
            if current.public_url.as_deref() != Some(url.as_str()) {
                self.coordinator
                    .attach_public_url(url)
                    .await
                    .map_err(tag(SetupStep::CoordinatorReady))?;
            }
        }
        self.checkpoint(SetupStep::CoordinatorReady).await?;

        let recorded_plugins = self.coordinator.record().await?.plugins;
        let plugins = if REQUIRED_PLUGINS
            .iter()
            .all(|p| recorded_plugins.iter().any(|n| n == p.name))
        {
            skipped.push(SetupStep::Plugins);
            None
        } else {
            Some(
                self.plugins
                    .install(REQUIRED_PLUGINS)
                    .await
                    .map_err(tag(SetupStep::Plugins))?,
            )
        };
        self.checkpoint(SetupStep::Plugins).await?;

        self.workers
            .ensure_image()
            .await
            .map_err(tag(SetupStep::ImageCheck))?;
        self.checkpoint(SetupStep::ImageCheck).await?;

        let admin = self.coordinator.admin().await?;
        let outcome = self
            .workers
            .deploy(options.agents, &options.limits, &admin)
            .await
            .map_err(tag(SetupStep::Workers))?;
        let workers = outcome.into_result().map_err(tag(SetupStep::Workers))?;
        self.checkpoint(SetupStep::Workers).await?;

        self.checkpoint(SetupStep::Done).await?;
        let report = SetupReport {
            coordinator: self.coordinator.record().await?,
            workers,
            plugins,
            public_url,
            skipped,
        };
        let failed = report.failed_registrations();
        if !failed.is_empty() {
            tracing::warn!(indices = ?failed, "setup finished with unregistered workers");
        }
        Ok(report)
    }

    /// Start a tunnel to the coordinator port and, if a coordinator is
    /// recorded, point it at the new URL.
    pub async fn start_tunnel(&self, port: Option<u16>) -> Result<String> {
        let port = port.unwrap_or(self.config.coordinator.http_port);
        let url = self.tunnel.start(port).await?;
        if self.store.load().await?.coordinator.is_some() {
            self.coordinator.attach_public_url(&url).await?;
        }
        Ok(url)
    }

    /// Tear down everything recorded: tunnel, workers, coordinator, then the
    /// shared resources. Key material is kept.
    pub async fn teardown(&self) -> Result<BatchOutcome<String>> {
        let mut outcome = BatchOutcome::default();

        match self.tunnel.stop().await {
            Ok(true) => outcome.succeeded.push("tunnel".to_string()),
            Ok(false) => {}
            Err(e) => outcome.record_failure("tunnel", e),
        }

        match self.workers.remove_all().await {
            Ok(workers) => {
                outcome
                    .succeeded
                    .extend(workers.succeeded.iter().map(|i| format!("worker {i}")));
                outcome.failed.extend(workers.failed);
            }
            Err(e) => outcome.record_failure("workers", e),
        }

        if self.store.load().await?.coordinator.is_some() {
            match self.coordinator.remove().await {
                Ok(()) => outcome.succeeded.push("coordinator".to_string()),
                Err(e) => outcome.record_failure("coordinator", e),
            }
        }

        match self.provisioner.teardown().await {
            Ok(()) => outcome.succeeded.push("network/volume".to_string()),
            Err(e) => outcome.record_failure("network/volume", e),
        }

        self.store.update(|s| s.last_completed_step = None).await?;
        Ok(outcome)
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        let state = self.store.load().await?;
        let runtime_reachable = self.runtime.ping().await.is_ok();
        let mut coordinator_container = None;
        let mut worker_containers = Vec::with_capacity(state.workers.len());
        if runtime_reachable {
            if let Some(record) = &state.coordinator {
                coordinator_container = self.runtime.state(&record.container_name).await?;
            }
            for w in &state.workers {
                worker_containers.push((w.index, self.runtime.state(&w.container_name).await?));
            }
        }
        let tunnel = self.tunnel.status().await?;
        Ok(ClusterStatus {
            state,
            runtime_reachable,
            coordinator_container,
            worker_containers,
            tunnel,
        })
    }
}
