use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable that relocates the whole tool directory.
pub const HOME_ENV: &str = "JENKINS_LOCAL_HOME";

/// User-tunable settings, read from `config.yaml` under the tool directory.
/// Every field has a default so an absent or partial file is fine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
    pub network: String,
    pub volume: String,
    pub tunnel: TunnelConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            agent: AgentConfig::default(),
            network: "jenkins-local-net".into(),
            volume: "jenkins-local-data".into(),
            tunnel: TunnelConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub container_name: String,
    pub image: String,
    pub http_port: u16,
    pub agent_port: u16,
    pub memory: Option<String>,
    pub cpus: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            container_name: "jenkins-local-master".into(),
            image: "jenkins/jenkins:lts".into(),
            http_port: 8080,
            agent_port: 50000,
            memory: Some("2g".into()),
            cpus: Some("2".into()),
        }
    }
}

impl CoordinatorConfig {
    /// Base URL of the management API as seen from the host.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.http_port)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub container_prefix: String,
    pub image: String,
    pub default_memory: String,
    pub default_cpus: String,
    pub docker_socket: String,
    pub remote_fs: String,
    pub max_parallel: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            container_prefix: "jenkins-local-agent".into(),
            image: "jenkins-local-agent:latest".into(),
            default_memory: "2g".into(),
            default_cpus: "2".into(),
            docker_socket: "/var/run/docker.sock".into(),
            remote_fs: "/home/jenkins/agent".into(),
            max_parallel: 4,
        }
    }
}

impl AgentConfig {
    pub fn container_name(&self, index: u32) -> String {
        format!("{}-{index}", self.container_prefix)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelConfig {
    pub binary: String,
    pub api_url: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: "ngrok".into(),
            api_url: "http://127.0.0.1:4040/api".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub readiness_secs: u64,
    pub tunnel_secs: u64,
    pub plugin_install_secs: u64,
    /// How long to wait for the coordinator to go down after a restart request.
    pub restart_down_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            readiness_secs: 180,
            tunnel_secs: 30,
            plugin_install_secs: 600,
            restart_down_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn readiness(&self) -> Duration {
        Duration::from_secs(self.readiness_secs)
    }

    pub fn tunnel(&self) -> Duration {
        Duration::from_secs(self.tunnel_secs)
    }

    pub fn plugin_install(&self) -> Duration {
        Duration::from_secs(self.plugin_install_secs)
    }

    pub fn restart_down(&self) -> Duration {
        Duration::from_secs(self.restart_down_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_secs: 8,
        }
    }
}

/// On-disk layout of the tool directory (default `~/.jenkins-local`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPaths {
    base: PathBuf,
}

impl ClusterPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `$JENKINS_LOCAL_HOME`, else `$HOME/.jenkins-local`, else `./.jenkins-local`.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::new(dir);
        }
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".jenkins-local"))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn state_file(&self) -> PathBuf {
        self.base.join("state.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.base.join("state.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.yaml")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.base.join("ssh")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base.join("backups")
    }

    pub fn tunnel_dir(&self) -> PathBuf {
        self.base.join("ngrok")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn agent_image_dir(&self) -> PathBuf {
        self.base.join("agent-image")
    }

    pub fn coordinator_init_dir(&self) -> PathBuf {
        self.base.join("coordinator").join("init.groovy.d")
    }
}
