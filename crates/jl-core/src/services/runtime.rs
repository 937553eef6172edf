use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{ClusterError, Result};

/// Label key used to tag every container this tool creates with its role.
pub const ROLE_LABEL: &str = "jenkins-local.role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
}

impl ContainerState {
    pub fn parse(status: &str) -> Option<Self> {
        match status.trim() {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "restarting" => Some(Self::Restarting),
            "exited" => Some(Self::Exited),
            "dead" => Some(Self::Dead),
            "removing" => Some(Self::Removing),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Removing => "removing",
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Everything needed for a detached `docker run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    /// `(host, container)` TCP port pairs.
    pub ports: Vec<(u16, u16)>,
    pub labels: Vec<(String, String)>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub group_add: Vec<String>,
    pub restart_policy: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn role(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == ROLE_LABEL)
            .map(|(_, v)| v.as_str())
    }

    /// Arguments after `docker`.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".into(), "--name".into(), self.name.clone()];
        if let Some(network) = &self.network {
            args.extend(["--network".into(), network.clone()]);
        }
        for mount in &self.mounts {
            let mut spec = format!("{}:{}", mount.source, mount.target);
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.extend(["-v".into(), spec]);
        }
        for (key, value) in &self.env {
            args.extend(["-e".into(), format!("{key}={value}")]);
        }
        for (host, container) in &self.ports {
            args.extend(["-p".into(), format!("{host}:{container}")]);
        }
        for (key, value) in &self.labels {
            args.extend(["--label".into(), format!("{key}={value}")]);
        }
        if let Some(memory) = &self.memory {
            args.extend(["--memory".into(), memory.clone()]);
        }
        if let Some(cpus) = &self.cpus {
            args.extend(["--cpus".into(), cpus.clone()]);
        }
        for group in &self.group_add {
            args.extend(["--group-add".into(), group.clone()]);
        }
        if let Some(policy) = &self.restart_policy {
            args.extend(["--restart".into(), policy.clone()]);
        }
        args.push(self.image.clone());
        args
    }
}

/// The slice of a container engine this tool needs. Lookups by name return
/// `Ok(None)` for "does not exist"; `Err` is reserved for engine failures.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fails with `RuntimeUnavailable` if the engine cannot be reached.
    async fn ping(&self) -> Result<()>;

    async fn find_network(&self, name: &str) -> Result<Option<String>>;
    async fn create_network(&self, name: &str) -> Result<String>;
    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn find_volume(&self, name: &str) -> Result<Option<String>>;
    async fn create_volume(&self, name: &str) -> Result<String>;
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Names of containers (running or not) attached to a network or volume.
    async fn containers_using(&self, network: &str, volume: &str) -> Result<Vec<String>>;

    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()>;

    /// Start a detached container and return its id.
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;
    async fn state(&self, name: &str) -> Result<Option<ContainerState>>;
    /// Value of [`ROLE_LABEL`] on an existing container; `None` when the
    /// container is absent or carries no role.
    async fn role(&self, name: &str) -> Result<Option<String>>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn restart(&self, name: &str) -> Result<()>;
    /// Force-remove; an absent container is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
    async fn logs(&self, name: &str, tail: Option<usize>) -> Result<String>;

    /// Run a throwaway container to completion (`docker run --rm`).
    async fn run_oneshot(&self, image: &str, mounts: &[Mount], command: &[String]) -> Result<String>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("docker"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run_docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| ClusterError::RuntimeUnavailable(format!("failed to run docker: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_daemon_down(&stderr) {
                return Err(ClusterError::RuntimeUnavailable(stderr.trim().to_string()));
            }
            return Err(ClusterError::Runtime(format!(
                "docker {} failed (exit {}): {}",
                args.first().copied().unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_docker_owned(&self, args: &[String]) -> Result<String> {
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_docker(&borrowed).await
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn is_daemon_down(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("Is the docker daemon running")
        || stderr.contains("error during connect")
}

fn is_not_found(err: &ClusterError) -> bool {
    match err {
        ClusterError::Runtime(msg) => {
            msg.contains("No such container")
                || msg.contains("No such object")
                || msg.contains("not found")
        }
        _ => false,
    }
}

/// First non-empty line of `docker ... ls --format` output.
pub fn first_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Non-empty, de-duplicated lines, order preserved.
pub fn parse_names(output: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !names.iter().any(|n| n == line) {
            names.push(line.to_string());
        }
    }
    names
}

/// Remove a leftover container named `name` if this tool created it with
/// `role`. A container under that name with any other role is someone
/// else's and fails with `ResourceConflict`.
pub async fn remove_leftover(runtime: &dyn ContainerRuntime, name: &str, role: &str) -> Result<()> {
    if runtime.state(name).await?.is_none() {
        return Ok(());
    }
    match runtime.role(name).await? {
        Some(found) if found == role => {
            tracing::info!(container = %name, role, "removing leftover container");
            runtime.remove(name).await
        }
        _ => Err(ClusterError::ResourceConflict(name.to_string())),
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<()> {
        self.run_docker(&["info", "--format", "{{.ServerVersion}}"])
            .await
            .map(|_| ())
            .map_err(|e| match e {
                ClusterError::Runtime(msg) => ClusterError::RuntimeUnavailable(msg),
                other => other,
            })
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>> {
        let filter = format!("name=^{name}$");
        let output = self
            .run_docker(&[
                "network", "ls", "--no-trunc", "--filter", &filter, "--format", "{{.ID}}",
            ])
            .await?;
        Ok(first_line(&output))
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let output = self.run_docker(&["network", "create", name]).await?;
        first_line(&output)
            .ok_or_else(|| ClusterError::Runtime(format!("network create {name} printed no id")))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        match self.run_docker(&["network", "rm", name]).await {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn find_volume(&self, name: &str) -> Result<Option<String>> {
        let filter = format!("name=^{name}$");
        let output = self
            .run_docker(&["volume", "ls", "--filter", &filter, "--format", "{{.Name}}"])
            .await?;
        Ok(first_line(&output))
    }

    async fn create_volume(&self, name: &str) -> Result<String> {
        let output = self.run_docker(&["volume", "create", name]).await?;
        Ok(first_line(&output).unwrap_or_else(|| name.to_string()))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self.run_docker(&["volume", "rm", name]).await {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn containers_using(&self, network: &str, volume: &str) -> Result<Vec<String>> {
        let network_filter = format!("network={network}");
        let volume_filter = format!("volume={volume}");
        let on_network = self
            .run_docker(&["ps", "-a", "--filter", &network_filter, "--format", "{{.Names}}"])
            .await?;
        let on_volume = self
            .run_docker(&["ps", "-a", "--filter", &volume_filter, "--format", "{{.Names}}"])
            .await?;
        Ok(parse_names(&format!("{on_network}\n{on_volume}")))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.run_docker(&["image", "inspect", "--format", "{{.Id}}", image]).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(ClusterError::Runtime(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()> {
        let context = context_dir.to_string_lossy();
        self.run_docker(&["build", "-t", tag, &context]).await?;
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.run_docker_owned(&spec.run_args()).await.map_err(|e| match e {
            ClusterError::Runtime(msg) if msg.contains("is already in use") => {
                ClusterError::ResourceConflict(spec.name.clone())
            }
            other => other,
        })?;
        first_line(&output)
            .ok_or_else(|| ClusterError::Runtime(format!("docker run {} printed no id", spec.name)))
    }

    async fn state(&self, name: &str) -> Result<Option<ContainerState>> {
        match self
            .run_docker(&["inspect", "--type", "container", "--format", "{{.State.Status}}", name])
            .await
        {
            Ok(output) => Ok(ContainerState::parse(&output)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn role(&self, name: &str) -> Result<Option<String>> {
        let format = format!("{{{{index .Config.Labels \"{ROLE_LABEL}\"}}}}");
        match self
            .run_docker(&["inspect", "--type", "container", "--format", &format, name])
            .await
        {
            Ok(output) => Ok(first_line(&output).filter(|role| role != "<no value>")),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run_docker(&["start", name]).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run_docker(&["stop", name]).await.map(|_| ())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.run_docker(&["restart", name]).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.run_docker(&["rm", "-f", name]).await {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn logs(&self, name: &str, tail: Option<usize>) -> Result<String> {
        // docker logs writes the container's stderr to our stderr, so capture both.
        let mut cmd = Command::new(&self.binary);
        cmd.arg("logs");
        if let Some(lines) = tail {
            cmd.args(["--tail", &lines.to_string()]);
        }
        cmd.arg(name);
        let output = cmd
            .output()
            .await
            .map_err(|e| ClusterError::RuntimeUnavailable(format!("failed to run docker: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::Runtime(format!(
                "docker logs {name} failed: {}",
                stderr.trim()
            )));
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn run_oneshot(&self, image: &str, mounts: &[Mount], command: &[String]) -> Result<String> {
        let mut args = vec!["run".to_string(), "--rm".into()];
        for mount in mounts {
            let mut spec = format!("{}:{}", mount.source, mount.target);
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.extend(["-v".into(), spec]);
        }
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        self.run_docker_owned(&args).await
    }
}
