use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use jl_core::models::config::HOME_ENV;
use jl_core::models::AdminCredentials;
use jl_core::services::coordinator::ControlAction;

/// Provision a local Jenkins coordinator with SSH workers in Docker.
#[derive(Debug, Parser)]
#[command(name = "jenkins-local", version)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Tool directory (default ~/.jenkins-local)
    #[arg(long, global = true, value_name = "DIR", env = HOME_ENV)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the whole cluster; completed steps are skipped on re-run
    Setup(SetupArgs),
    /// Remove tunnel, workers, coordinator, network and volume
    Teardown,
    /// Shared network and volume
    #[command(subcommand)]
    Docker(DockerCommand),
    /// Worker SSH key pair
    #[command(subcommand)]
    Ssh(SshCommand),
    /// Public tunnel to the coordinator
    #[command(subcommand)]
    Ngrok(NgrokCommand),
    /// Coordinator container
    #[command(subcommand)]
    Master(MasterCommand),
    /// Worker containers
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Show everything recorded and its live state
    Status {
        /// Print the recorded state as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Args, PartialEq, Eq)]
pub struct AdminArgs {
    #[arg(long = "admin-user", value_name = "USER")]
    pub user: Option<String>,
    #[arg(long = "admin-password", value_name = "PASSWORD")]
    pub password: Option<String>,
}

impl AdminArgs {
    /// Explicit values over `fallback`, field by field.
    pub fn resolve(&self, fallback: &AdminCredentials) -> AdminCredentials {
        AdminCredentials::new(
            self.user.clone().unwrap_or_else(|| fallback.username.clone()),
            self.password
                .clone()
                .unwrap_or_else(|| fallback.password.clone()),
        )
    }

    pub fn is_given(&self) -> bool {
        self.user.is_some() || self.password.is_some()
    }
}

#[derive(Debug, Clone, Args, PartialEq, Eq)]
pub struct LimitArgs {
    /// Memory per worker, e.g. 2g
    #[arg(long)]
    pub memory: Option<String>,
    /// CPUs per worker, e.g. 1.5
    #[arg(long)]
    pub cpus: Option<String>,
}

#[derive(Debug, Args)]
pub struct SetupArgs {
    /// Number of workers
    #[arg(long, default_value_t = 1)]
    pub agents: usize,
    #[command(flatten)]
    pub limits: LimitArgs,
    #[command(flatten)]
    pub admin: AdminArgs,
    /// Expose the coordinator through a tunnel
    #[arg(long)]
    pub public: bool,
}

#[derive(Debug, Subcommand)]
pub enum DockerCommand {
    /// Create the network and volume if missing
    Init,
    /// Remove the network and volume
    Teardown,
    /// Archive or restore the shared volume
    #[command(subcommand)]
    Volume(VolumeCommand),
}

#[derive(Debug, Subcommand)]
pub enum VolumeCommand {
    Backup {
        /// Archive path (default backups/volume-TIMESTAMP.tar.gz)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Restore {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum SshCommand {
    /// Generate a new RSA key pair
    Generate {
        /// Back up and replace an existing pair
        #[arg(long)]
        force: bool,
    },
    /// Print the public key
    Show,
    /// Copy the key pair into backups/
    Backup,
}

#[derive(Debug, Subcommand)]
pub enum NgrokCommand {
    /// Save the tunnel auth token
    Auth { token: String },
    Start {
        /// Local port to expose (default: coordinator HTTP port)
        #[arg(long)]
        port: Option<u16>,
    },
    Stop,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlArg {
    Start,
    Stop,
    Restart,
}

impl From<ControlArg> for ControlAction {
    fn from(arg: ControlArg) -> Self {
        match arg {
            ControlArg::Start => ControlAction::Start,
            ControlArg::Stop => ControlAction::Stop,
            ControlArg::Restart => ControlAction::Restart,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum MasterCommand {
    /// Start the coordinator container
    Deploy {
        #[command(flatten)]
        admin: AdminArgs,
    },
    Status,
    Control {
        #[arg(value_enum)]
        action: ControlArg,
    },
    Logs {
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Stop and remove the coordinator container
    Remove,
    /// Install the required plugins
    Plugins {
        #[command(flatten)]
        admin: AdminArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    /// Grow the pool to COUNT workers
    Deploy {
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[command(flatten)]
        limits: LimitArgs,
        #[command(flatten)]
        admin: AdminArgs,
    },
    List,
    Logs {
        index: Option<u32>,
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Retry node registration for one worker
    Register {
        index: u32,
        #[command(flatten)]
        admin: AdminArgs,
    },
    Remove {
        index: u32,
    },
    RemoveAll,
}
