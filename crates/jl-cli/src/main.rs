use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use jl_cli::cli::Cli;
use jl_cli::{commands, output};
use jl_core::models::ClusterPaths;

const LOG_FILE: &str = "jenkins-local.log";

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version print here too, with exit code 0.
            let _ = e.print();
            let code = u8::try_from(e.exit_code()).unwrap_or(2);
            return Ok(ExitCode::from(code));
        }
    };

    let paths = commands::resolve_paths(cli.home.clone());
    let _guard = init_logging(&paths, cli.verbose)?;
    tracing::debug!(home = %paths.base().display(), "starting");

    let code = tokio::select! {
        result = commands::run(cli.command, paths) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, step = ?e.failed_step(), "command failed");
                eprint!("{}", output::render_error(&e));
                ExitCode::from(output::exit_code(e.kind()))
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; state is kept at the last completed step");
            eprintln!("interrupted; re-run the command to resume");
            ExitCode::from(output::INTERRUPTED)
        }
    };
    Ok(code)
}

/// Log to stderr and, without ANSI codes, to `logs/jenkins-local.log`.
/// The returned guard flushes the file writer on drop.
fn init_logging(
    paths: &ClusterPaths,
    verbose: bool,
) -> color_eyre::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(paths.logs_dir())?;
    let file_appender = tracing_appender::rolling::never(paths.logs_dir(), LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .init();

    Ok(guard)
}
