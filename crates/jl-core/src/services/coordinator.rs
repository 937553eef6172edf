use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::models::{
    AdminCredentials, ClusterConfig, ClusterPaths, CoordinatorRecord, CoordinatorStatus,
};

use super::jenkins::ManagementApi;
use super::poll::{poll_until, Backoff, PollPolicy};
use super::runtime::{
    remove_leftover, ContainerRuntime, ContainerSpec, ContainerState, Mount, ROLE_LABEL,
};
use super::state::StateStore;

const JENKINS_HOME: &str = "/var/jenkins_home";
const INIT_SCRIPTS_TARGET: &str = "/usr/share/jenkins/ref/init.groovy.d";
const INIT_SCRIPT_NAME: &str = "10-jenkins-local-security.groovy";
const MASTER_ROLE: &str = "master";
const DOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Runs on every coordinator boot: admin account from the environment,
/// logged-in-users-only authorization, and the location URL when given.
const INIT_SCRIPT: &str = r#"import hudson.security.FullControlOnceLoggedInAuthorizationStrategy
import hudson.security.HudsonPrivateSecurityRealm
import jenkins.model.Jenkins
import jenkins.model.JenkinsLocationConfiguration

def env = System.getenv()
def jenkins = Jenkins.get()

def realm = jenkins.getSecurityRealm()
if (!(realm instanceof HudsonPrivateSecurityRealm)) {
    realm = new HudsonPrivateSecurityRealm(false)
    jenkins.setSecurityRealm(realm)
}
if (realm.getUser(env['JENKINS_ADMIN_ID']) == null) {
    realm.createAccount(env['JENKINS_ADMIN_ID'], env['JENKINS_ADMIN_PASSWORD'])
}

def strategy = new FullControlOnceLoggedInAuthorizationStrategy()
strategy.setAllowAnonymousRead(false)
jenkins.setAuthorizationStrategy(strategy)

if (env['JENKINS_URL']) {
    def location = JenkinsLocationConfiguration.get()
    location.setUrl(env['JENKINS_URL'])
    location.save()
}
jenkins.save()
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Restart => "restart",
        }
    }
}

/// Read-only view for `master status`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorReport {
    pub record: CoordinatorRecord,
    pub container: Option<ContainerState>,
    pub reachable: bool,
    pub local_url: String,
}

/// Script-console snippet that points the coordinator at `url`.
pub fn location_script(url: &str) -> String {
    let escaped = url.replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        "def location = jenkins.model.JenkinsLocationConfiguration.get()\n\
         location.setUrl('{escaped}')\n\
         location.save()\n\
         println(location.getUrl())\n"
    )
}

pub struct CoordinatorController {
    runtime: Arc<dyn ContainerRuntime>,
    api: Arc<dyn ManagementApi>,
    store: Arc<StateStore>,
    config: Arc<ClusterConfig>,
    paths: ClusterPaths,
}

impl CoordinatorController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        api: Arc<dyn ManagementApi>,
        store: Arc<StateStore>,
        config: Arc<ClusterConfig>,
        paths: ClusterPaths,
    ) -> Self {
        Self {
            runtime,
            api,
            store,
            config,
            paths,
        }
    }

    fn container_name(&self) -> &str {
        &self.config.coordinator.container_name
    }

    /// The recorded coordinator, or `CoordinatorNotDeployed`.
    pub async fn record(&self) -> Result<CoordinatorRecord> {
        self.store
            .load()
            .await?
            .coordinator
            .ok_or(ClusterError::CoordinatorNotDeployed)
    }

    /// Admin credentials recorded at deploy time.
    pub async fn admin(&self) -> Result<AdminCredentials> {
        Ok(self.record().await?.admin)
    }

    /// The coordinator's container is up, whatever the record says.
    pub async fn is_running(&self) -> Result<bool> {
        Ok(self
            .runtime
            .state(self.container_name())
            .await?
            .map(ContainerState::is_running)
            .unwrap_or(false))
    }

    pub async fn deploy(
        &self,
        admin: &AdminCredentials,
        public_url: Option<&str>,
    ) -> Result<CoordinatorRecord> {
        if admin.username.trim().is_empty() || admin.password.is_empty() {
            return Err(ClusterError::InvalidInput(
                "admin username and password must not be empty".into(),
            ));
        }
        let state = self.store.load().await?;
        if !state.has_shared_resources() {
            return Err(ClusterError::PrerequisiteMissing(
                "shared network and volume do not exist".into(),
            ));
        }
        if state.coordinator.is_some() && self.is_running().await? {
            return Err(ClusterError::AlreadyDeployed(self.container_name().to_string()));
        }
        // Dead, or left behind by a run that died before recording it.
        remove_leftover(self.runtime.as_ref(), self.container_name(), MASTER_ROLE).await?;

        let init_dir = self.write_init_script().await?;
        let spec = self.container_spec(admin, public_url, &init_dir);
        let container_id = self.runtime.run(&spec).await?;
        tracing::info!(container = self.container_name(), id = %container_id, "coordinator container started");

        let record = CoordinatorRecord::new(
            container_id,
            self.container_name().to_string(),
            admin.clone(),
            public_url.map(str::to_string),
        );
        let recorded = record.clone();
        self.store.update(|s| s.coordinator = Some(recorded)).await?;
        Ok(record)
    }

    async fn write_init_script(&self) -> Result<String> {
        let dir = self.paths.coordinator_init_dir();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(INIT_SCRIPT_NAME), INIT_SCRIPT).await?;
        Ok(std::path::absolute(&dir)?.to_string_lossy().to_string())
    }

    fn container_spec(
        &self,
        admin: &AdminCredentials,
        public_url: Option<&str>,
        init_dir: &str,
    ) -> ContainerSpec {
        let cfg = &self.config.coordinator;
        let mut spec = ContainerSpec::new(cfg.container_name.clone(), cfg.image.clone());
        spec.network = Some(self.config.network.clone());
        spec.mounts = vec![
            Mount::new(self.config.volume.clone(), JENKINS_HOME),
            Mount::new(init_dir, INIT_SCRIPTS_TARGET).read_only(),
        ];
        spec.env = vec![
            ("JENKINS_ADMIN_ID".into(), admin.username.clone()),
            ("JENKINS_ADMIN_PASSWORD".into(), admin.password.clone()),
            (
                "JAVA_OPTS".into(),
                "-Djenkins.install.runSetupWizard=false".into(),
            ),
        ];
        if let Some(url) = public_url {
            spec.env.push(("JENKINS_URL".into(), url.to_string()));
        }
        spec.ports = vec![(cfg.http_port, 8080), (cfg.agent_port, 50000)];
        spec.labels = vec![(ROLE_LABEL.into(), MASTER_ROLE.into())];
        spec.memory = cfg.memory.clone();
        spec.cpus = cfg.cpus.clone();
        spec.restart_policy = Some("unless-stopped".into());
        spec
    }

    /// Poll the login page until it answers, then mark the record ready.
    /// On timeout the record is marked unready; nothing is rolled back.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.record().await?;
        let api = self.api.clone();
        let ready = poll_until(PollPolicy::readiness(timeout), || {
            let api = api.clone();
            async move { api.is_up().await.then_some(()) }
        })
        .await
        .is_some();

        let status = if ready {
            CoordinatorStatus::Ready
        } else {
            CoordinatorStatus::Unready
        };
        self.set_status(status).await?;
        if !ready {
            return Err(ClusterError::ReadinessTimeout(timeout.as_secs()));
        }
        tracing::info!(url = %self.config.coordinator.local_url(), "coordinator is ready");
        Ok(())
    }

    /// Poll until the coordinator stops answering. Returns whether it did.
    pub async fn wait_down(&self, timeout: Duration) -> bool {
        let api = self.api.clone();
        poll_until(PollPolicy::new(Backoff::fixed(DOWN_POLL_INTERVAL), timeout), || {
            let api = api.clone();
            async move { (!api.is_up().await).then_some(()) }
        })
        .await
        .is_some()
    }

    async fn set_status(&self, status: CoordinatorStatus) -> Result<()> {
        self.store
            .update(|s| {
                if let Some(record) = s.coordinator.as_mut() {
                    record.status = status;
                }
            })
            .await?;
        Ok(())
    }

    /// Start, stop or restart the container. Stopping a stopped coordinator
    /// is a no-op. Start and restart leave the record `starting`; callers
    /// wait for readiness separately.
    pub async fn control(&self, action: ControlAction) -> Result<CoordinatorRecord> {
        self.record().await?;
        let name = self.container_name();
        let current = self.runtime.state(name).await?;
        if current.is_none() {
            return Err(ClusterError::CoordinatorNotDeployed);
        }
        let running = current.map(ContainerState::is_running).unwrap_or(false);

        let status = match action {
            ControlAction::Start => {
                if !running {
                    self.runtime.start(name).await?;
                }
                CoordinatorStatus::Starting
            }
            ControlAction::Stop => {
                if running {
                    self.runtime.stop(name).await?;
                } else {
                    tracing::debug!(container = name, "coordinator already stopped");
                }
                CoordinatorStatus::Stopped
            }
            ControlAction::Restart => {
                self.runtime.restart(name).await?;
                CoordinatorStatus::Starting
            }
        };
        tracing::info!(container = name, action = action.as_str(), "coordinator control");
        self.set_status(status).await?;
        self.record().await
    }

    pub async fn status(&self) -> Result<CoordinatorReport> {
        let record = self.record().await?;
        let container = self.runtime.state(self.container_name()).await?;
        let reachable = container.map(ContainerState::is_running).unwrap_or(false) && self.api.is_up().await;
        Ok(CoordinatorReport {
            record,
            container,
            reachable,
            local_url: self.config.coordinator.local_url(),
        })
    }

    pub async fn logs(&self, tail: Option<usize>) -> Result<String> {
        self.record().await?;
        self.runtime.logs(self.container_name(), tail).await
    }

    /// Record the public URL and, if the coordinator is ready, apply it via
    /// the script console. A coordinator that is not ready picks the URL up
    /// at its next deploy.
    pub async fn attach_public_url(&self, url: &str) -> Result<()> {
        let record = self.record().await?;
        if record.is_ready() && self.api.is_up().await {
            self.api.run_script(&record.admin, &location_script(url)).await?;
            tracing::info!(%url, "coordinator location URL updated");
        }
        let url = url.to_string();
        self.store
            .update(|s| {
                if let Some(record) = s.coordinator.as_mut() {
                    record.public_url = Some(url);
                }
            })
            .await?;
        Ok(())
    }

    /// Remove the container and forget the record. An absent container is fine.
    pub async fn remove(&self) -> Result<()> {
        self.runtime.remove(self.container_name()).await?;
        self.store.update(|s| s.coordinator = None).await?;
        tracing::info!(container = self.container_name(), "coordinator removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;

    async fn deployed(cluster: &TestCluster) -> CoordinatorController {
        cluster.provisioner().init().await.unwrap();
        let coordinator = cluster.coordinator();
        coordinator
            .deploy(&AdminCredentials::new("admin", "secret"), Some("https://fake.ngrok.app"))
            .await
            .unwrap();
        coordinator
    }

    #[tokio::test]
    async fn deploy_requires_shared_resources() {
        let cluster = TestCluster::new();
        let err = cluster
            .coordinator()
            .deploy(&AdminCredentials::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PrerequisiteMissing(_)));
        assert_eq!(err.remediation(), Some("run `jenkins-local docker init`"));
    }

    #[tokio::test]
    async fn deploy_configures_container() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;

        let spec = cluster.runtime.spec("jenkins-local-master").unwrap();
        assert_eq!(spec.role(), Some("master"));
        assert_eq!(spec.network.as_deref(), Some("jenkins-local-net"));
        assert!(spec
            .env
            .contains(&("JENKINS_URL".to_string(), "https://fake.ngrok.app".to_string())));
        assert!(spec.ports.contains(&(8080, 8080)));
        assert!(cluster
            .paths
            .coordinator_init_dir()
            .join(INIT_SCRIPT_NAME)
            .is_file());

        let record = coordinator.record().await.unwrap();
        assert_eq!(record.status, CoordinatorStatus::Starting);
        assert_eq!(record.admin.password, "secret");
    }

    #[tokio::test]
    async fn running_coordinator_is_not_redeployed() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;
        let err = coordinator
            .deploy(&AdminCredentials::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyDeployed(_)));
    }

    #[tokio::test]
    async fn foreign_container_under_coordinator_name_is_a_conflict() {
        let cluster = TestCluster::new();
        cluster.provisioner().init().await.unwrap();
        cluster.runtime.add_container_on_network("jenkins-local-master");

        let err = cluster
            .coordinator()
            .deploy(&AdminCredentials::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ResourceConflict(_)));
        assert_eq!(cluster.runtime.spec("jenkins-local-master").unwrap().image, "external");
        assert!(cluster.store.load().await.unwrap().coordinator.is_none());
    }

    #[tokio::test]
    async fn dead_coordinator_is_replaced() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;
        let first = coordinator.record().await.unwrap().container_id;
        cluster.runtime.set_state("jenkins-local-master", ContainerState::Exited);

        let record = coordinator
            .deploy(&AdminCredentials::default(), None)
            .await
            .unwrap();
        assert_ne!(record.container_id, first);
        assert_eq!(cluster.runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn wait_ready_marks_record() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;
        coordinator.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert!(coordinator.record().await.unwrap().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_times_out_as_unready() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;
        cluster.api.set_up(false);
        let err = coordinator.wait_ready(Duration::from_secs(20)).await.unwrap_err();
        assert!(matches!(err, ClusterError::ReadinessTimeout(20)));
        assert_eq!(
            coordinator.record().await.unwrap().status,
            CoordinatorStatus::Unready
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;
        let record = coordinator.control(ControlAction::Stop).await.unwrap();
        assert_eq!(record.status, CoordinatorStatus::Stopped);
        let record = coordinator.control(ControlAction::Stop).await.unwrap();
        assert_eq!(record.status, CoordinatorStatus::Stopped);
        assert_eq!(
            cluster.runtime.container_state("jenkins-local-master"),
            Some(ContainerState::Exited)
        );

        coordinator.control(ControlAction::Start).await.unwrap();
        assert!(coordinator.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn attach_url_applies_through_script_console_when_ready() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;
        coordinator.wait_ready(Duration::from_secs(5)).await.unwrap();

        coordinator.attach_public_url("https://other.ngrok.app").await.unwrap();
        let scripts = cluster.api.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("setUrl('https://other.ngrok.app')"));
        assert_eq!(
            coordinator.record().await.unwrap().public_url.as_deref(),
            Some("https://other.ngrok.app")
        );
    }

    #[tokio::test]
    async fn remove_clears_record() {
        let cluster = TestCluster::new();
        let coordinator = deployed(&cluster).await;
        coordinator.remove().await.unwrap();
        assert!(matches!(
            coordinator.record().await,
            Err(ClusterError::CoordinatorNotDeployed)
        ));
        assert_eq!(cluster.runtime.container_count(), 0);
        coordinator.remove().await.unwrap();
    }

    #[test]
    fn location_script_escapes_quotes() {
        let script = location_script("https://x.io/it's");
        assert!(script.contains(r"setUrl('https://x.io/it\'s')"));
    }
}
