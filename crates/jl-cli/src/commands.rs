use std::path::PathBuf;

use jl_core::models::{AdminCredentials, BatchOutcome, ClusterPaths};
use jl_core::services::config_loader;
use jl_core::services::orchestrator::{
    validate_agent_count, worker_limits, Orchestrator, SetupOptions,
};
use jl_core::{ClusterError, Result};

use crate::cli::{
    AdminArgs, AgentCommand, Command, DockerCommand, LimitArgs, MasterCommand, NgrokCommand,
    SetupArgs, SshCommand, VolumeCommand,
};
use crate::output;

/// `--home`, else the environment default.
pub fn resolve_paths(home: Option<PathBuf>) -> ClusterPaths {
    home.map(ClusterPaths::new)
        .unwrap_or_else(ClusterPaths::from_env)
}

pub async fn run(command: Command, paths: ClusterPaths) -> Result<()> {
    let config = config_loader::load(&paths)?;
    let orchestrator = Orchestrator::with_defaults(config, paths)?;
    dispatch(&orchestrator, command).await
}

pub async fn dispatch(orch: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Setup(args) => setup(orch, args).await,
        Command::Teardown => {
            let outcome = orch.teardown().await?;
            print!("{}", output::render_batch("removed", &outcome));
            outcome.into_result().map(|_| ())
        }
        Command::Docker(cmd) => docker(orch, cmd).await,
        Command::Ssh(cmd) => ssh(orch, cmd).await,
        Command::Ngrok(cmd) => ngrok(orch, cmd).await,
        Command::Master(cmd) => master(orch, cmd).await,
        Command::Agent(cmd) => agent(orch, cmd).await,
        Command::Status { json: true } => {
            let state = orch.store.load().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::Status { json: false } => {
            let status = orch.status().await?;
            print!("{}", output::render_status(&status));
            Ok(())
        }
    }
}

fn limits(orch: &Orchestrator, args: &LimitArgs) -> Result<jl_core::models::ResourceLimits> {
    let agent = &orch.config.agent;
    worker_limits(
        args.memory.as_deref().unwrap_or(&agent.default_memory),
        args.cpus.as_deref().unwrap_or(&agent.default_cpus),
    )
}

/// Credentials recorded on the coordinator, or the deploy defaults if none.
async fn recorded_admin(orch: &Orchestrator) -> Result<AdminCredentials> {
    Ok(orch
        .store
        .load()
        .await?
        .coordinator
        .map(|c| c.admin)
        .unwrap_or_default())
}

/// Apply explicitly given credentials to the coordinator record.
async fn override_admin(orch: &Orchestrator, args: &AdminArgs) -> Result<()> {
    if !args.is_given() {
        return Ok(());
    }
    let admin = args.resolve(&orch.coordinator.admin().await?);
    orch.store
        .try_update(move |s| match s.coordinator.as_mut() {
            Some(record) => {
                record.admin = admin;
                Ok(())
            }
            None => Err(ClusterError::CoordinatorNotDeployed),
        })
        .await
}

async fn setup(orch: &Orchestrator, args: SetupArgs) -> Result<()> {
    let options = SetupOptions {
        agents: args.agents,
        limits: limits(orch, &args.limits)?,
        admin: args.admin.resolve(&recorded_admin(orch).await?),
        public: args.public,
    };
    let report = orch.setup(&options).await?;
    print!("{}", output::render_setup(&report));
    Ok(())
}

async fn docker(orch: &Orchestrator, cmd: DockerCommand) -> Result<()> {
    match cmd {
        DockerCommand::Init => {
            let shared = orch.provisioner.init().await?;
            println!("network {}", shared.network_id);
            println!("volume  {}", shared.volume_id);
        }
        DockerCommand::Teardown => {
            orch.provisioner.teardown().await?;
            println!("removed network and volume");
        }
        DockerCommand::Volume(VolumeCommand::Backup { file }) => {
            let path = orch.provisioner.backup_volume(file.as_deref()).await?;
            println!("volume archived to {}", path.display());
        }
        DockerCommand::Volume(VolumeCommand::Restore { file }) => {
            orch.provisioner.restore_volume(&file).await?;
            println!("volume restored from {}", file.display());
        }
    }
    Ok(())
}

async fn ssh(orch: &Orchestrator, cmd: SshCommand) -> Result<()> {
    match cmd {
        SshCommand::Generate { force } => {
            let pair = orch.keys.generate(force).await?;
            println!("private key  {}", pair.private_key_path.display());
            println!("public key   {}", pair.public_key_path.display());
            println!("fingerprint  {}", pair.fingerprint);
        }
        SshCommand::Show => println!("{}", orch.keys.show().await?),
        SshCommand::Backup => {
            let dir = orch.keys.backup().await?;
            println!("keys backed up to {}", dir.display());
        }
    }
    Ok(())
}

async fn ngrok(orch: &Orchestrator, cmd: NgrokCommand) -> Result<()> {
    match cmd {
        NgrokCommand::Auth { token } => {
            orch.tunnel.authenticate(&token).await?;
            println!("tunnel auth token saved");
        }
        NgrokCommand::Start { port } => println!("{}", orch.start_tunnel(port).await?),
        NgrokCommand::Stop => {
            if orch.tunnel.stop().await? {
                println!("tunnel stopped");
            } else {
                println!("no tunnel running");
            }
        }
        NgrokCommand::Status => print!("{}", output::render_tunnel(&orch.tunnel.status().await?)),
    }
    Ok(())
}

async fn master(orch: &Orchestrator, cmd: MasterCommand) -> Result<()> {
    match cmd {
        MasterCommand::Deploy { admin } => {
            let admin = admin.resolve(&AdminCredentials::default());
            let public_url = orch.tunnel.status().await?.public_url;
            orch.coordinator.deploy(&admin, public_url.as_deref()).await?;
            orch.coordinator
                .wait_ready(orch.config.timeouts.readiness())
                .await?;
            print!("{}", output::render_coordinator(&orch.coordinator.status().await?));
        }
        MasterCommand::Status => {
            print!("{}", output::render_coordinator(&orch.coordinator.status().await?))
        }
        MasterCommand::Control { action } => {
            let record = orch.coordinator.control(action.into()).await?;
            println!("coordinator {}", record.status.as_str());
        }
        MasterCommand::Logs { tail } => print!("{}", orch.coordinator.logs(tail).await?),
        MasterCommand::Remove => {
            orch.coordinator.remove().await?;
            println!("coordinator removed");
        }
        MasterCommand::Plugins { admin } => {
            override_admin(orch, &admin).await?;
            let result = orch
                .plugins
                .install(jl_core::models::REQUIRED_PLUGINS)
                .await?;
            print!("{}", output::render_install(&result));
        }
    }
    Ok(())
}

async fn agent(orch: &Orchestrator, cmd: AgentCommand) -> Result<()> {
    match cmd {
        AgentCommand::Deploy {
            count,
            limits: limit_args,
            admin,
        } => {
            validate_agent_count(count)?;
            let limits = limits(orch, &limit_args)?;
            let admin = admin.resolve(&orch.coordinator.admin().await?);
            orch.workers.ensure_image().await?;
            let outcome = orch.workers.deploy(count, &limits, &admin).await?;
            let live = orch.workers.container_states().await?;
            print!("{}", output::render_workers(&outcome.succeeded, &live));
            for failure in &outcome.failed {
                println!("failed {}: {}", failure.item, failure.error);
            }
            outcome.into_result().map(|_| ())
        }
        AgentCommand::List => {
            let workers = orch.workers.list().await?;
            let live = orch.workers.container_states().await?;
            print!("{}", output::render_workers(&workers, &live));
            Ok(())
        }
        AgentCommand::Logs { index, tail } => {
            let logs = orch.workers.logs(index, tail).await?;
            let many = logs.len() > 1;
            for (i, text) in logs {
                if many {
                    println!("==> worker {i} <==");
                }
                print!("{text}");
            }
            Ok(())
        }
        AgentCommand::Register { index, admin } => {
            let admin = if admin.is_given() {
                Some(admin.resolve(&orch.coordinator.admin().await?))
            } else {
                None
            };
            let record = orch.workers.register(index, admin.as_ref()).await?;
            println!("worker {index} {}", record.registration.as_str());
            Ok(())
        }
        AgentCommand::Remove { index } => {
            orch.workers.remove(index).await?;
            println!("removed worker {index}");
            Ok(())
        }
        AgentCommand::RemoveAll => {
            let outcome = orch.workers.remove_all().await?;
            let named = BatchOutcome {
                succeeded: outcome
                    .succeeded
                    .iter()
                    .map(|i| format!("worker {i}"))
                    .collect::<Vec<_>>(),
                failed: outcome.failed.clone(),
            };
            print!("{}", output::render_batch("removed", &named));
            outcome.into_result().map(|_| ())
        }
    }
}
