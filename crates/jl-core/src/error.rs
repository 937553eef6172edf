use std::path::PathBuf;

use crate::models::SetupStep;

/// Coarse failure classes. The CLI maps each to a distinct exit code so
/// scripted callers can branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PrerequisiteMissing,
    ResourceConflict,
    Transient,
    Timeout,
    PartialFailure,
    InvalidInput,
    State,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("container runtime is unreachable: {0}")]
    RuntimeUnavailable(String),

    #[error("container runtime command failed: {0}")]
    Runtime(String),

    #[error("state file {path} is corrupt: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },

    #[error("state is locked by process {pid} (since {since})")]
    StateLocked { pid: u32, since: String },

    #[error("state persistence failed: {0}")]
    State(String),

    #[error("config file {path} is invalid: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    PrerequisiteMissing(String),

    #[error("{resource} is still used by containers: {}", .users.join(", "))]
    ResourceInUse {
        resource: String,
        users: Vec<String>,
    },

    #[error("name '{0}' is already used by an unrelated resource")]
    ResourceConflict(String),

    #[error("SSH key pair already exists at {0}")]
    KeyExists(PathBuf),

    #[error("no SSH key pair found at {0}")]
    KeyNotFound(PathBuf),

    #[error("ssh-keygen failed: {0}")]
    KeyGeneration(String),

    #[error("tunnel is not authenticated")]
    TunnelNotAuthenticated,

    #[error("tunnel did not report a public URL within {0}s")]
    TunnelTimeout(u64),

    #[error("tunnel operation failed: {0}")]
    Tunnel(String),

    #[error("coordinator '{0}' is already deployed and running")]
    AlreadyDeployed(String),

    #[error("coordinator is not deployed")]
    CoordinatorNotDeployed,

    #[error("coordinator did not become ready within {0}s")]
    ReadinessTimeout(u64),

    #[error("management API rejected the request: {0}")]
    AuthRejected(String),

    #[error("management API request failed transiently: {0}")]
    TransientService(String),

    #[error("management API request failed: {0}")]
    Api(String),

    #[error("plugin installation rejected: {0}")]
    PluginInstallRejected(String),

    #[error("plugin installation did not finish within {0}s")]
    PluginInstallTimeout(u64),

    #[error("plugins partially installed (installed: {}; failed: {})", .installed.join(", "), format_failures(.failed))]
    PartialInstall {
        installed: Vec<String>,
        failed: Vec<(String, String)>,
    },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    OperationFailed {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("worker {0} not found")]
    WorkerNotFound(u32),

    #[error("{failed} of {total} operations failed: {summary}")]
    PartialFailure {
        total: usize,
        failed: usize,
        summary: String,
    },

    #[error("setup failed at {step}: {source}")]
    SetupStep {
        step: SetupStep,
        #[source]
        source: Box<ClusterError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

fn format_failures(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(name, reason)| format!("{name} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RuntimeUnavailable(_)
            | Self::PrerequisiteMissing(_)
            | Self::KeyNotFound(_)
            | Self::TunnelNotAuthenticated
            | Self::CoordinatorNotDeployed => ErrorKind::PrerequisiteMissing,
            Self::ResourceInUse { .. }
            | Self::ResourceConflict(_)
            | Self::KeyExists(_)
            | Self::AlreadyDeployed(_) => ErrorKind::ResourceConflict,
            Self::TransientService(_) | Self::OperationFailed { .. } => ErrorKind::Transient,
            Self::TunnelTimeout(_)
            | Self::ReadinessTimeout(_)
            | Self::PluginInstallTimeout(_) => ErrorKind::Timeout,
            Self::PartialInstall { .. } | Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::InvalidInput(_) | Self::InvalidConfig { .. } | Self::WorkerNotFound(_) => {
                ErrorKind::InvalidInput
            }
            Self::StateCorrupt { .. } | Self::StateLocked { .. } | Self::State(_) => {
                ErrorKind::State
            }
            Self::SetupStep { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientService(_))
    }

    /// The command an operator should run to get past this failure, if any.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::RuntimeUnavailable(_) => Some("start the Docker daemon, then retry"),
            Self::TunnelNotAuthenticated => Some("run `jenkins-local ngrok auth <token>`"),
            Self::KeyNotFound(_) => Some("run `jenkins-local ssh generate`"),
            Self::KeyExists(_) => Some("run `jenkins-local ssh generate --force` to back up and replace"),
            Self::CoordinatorNotDeployed => Some("run `jenkins-local master deploy`"),
            Self::AlreadyDeployed(_) => Some("run `jenkins-local master control restart` or `jenkins-local teardown`"),
            Self::ResourceInUse { .. } => Some("run `jenkins-local teardown` to remove dependent containers first"),
            Self::ResourceConflict(_) => Some("remove the conflicting resource or rename it in config.yaml"),
            Self::ReadinessTimeout(_) => Some("inspect `jenkins-local master logs`, then re-run `jenkins-local setup`"),
            Self::StateLocked { .. } => Some("wait for the other jenkins-local process to finish"),
            Self::StateCorrupt { .. } => Some("fix or move aside state.json; `jenkins-local teardown` needs a readable state"),
            Self::PartialInstall { .. } | Self::OperationFailed { .. } => {
                Some("re-run `jenkins-local setup`; completed steps are skipped")
            }
            Self::PrerequisiteMissing(_) => Some("run `jenkins-local docker init`"),
            Self::SetupStep { source, .. } => source.remediation(),
            _ => None,
        }
    }

    /// The setup step this failure occurred in, if it came from the orchestrator.
    pub fn failed_step(&self) -> Option<SetupStep> {
        match self {
            Self::SetupStep { step, .. } => Some(*step),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
