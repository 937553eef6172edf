use std::fmt::Write;

use jl_core::models::{BatchOutcome, InstallResult, TunnelStatus, WorkerRecord};
use jl_core::services::coordinator::CoordinatorReport;
use jl_core::services::orchestrator::{ClusterStatus, SetupReport};
use jl_core::services::runtime::ContainerState;
use jl_core::{ClusterError, ErrorKind};

/// Exit code for an interrupted run.
pub const INTERRUPTED: u8 = 130;

pub fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidInput => 2,
        ErrorKind::PrerequisiteMissing => 3,
        ErrorKind::ResourceConflict => 4,
        ErrorKind::Transient => 5,
        ErrorKind::Timeout => 6,
        ErrorKind::PartialFailure => 7,
        ErrorKind::State => 8,
        ErrorKind::Other => 1,
    }
}

fn row(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{key:<13}{value}");
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

/// Failure report: the failing step if any, the cause, and a fix command.
pub fn render_error(err: &ClusterError) -> String {
    let mut out = String::new();
    match err {
        ClusterError::SetupStep { step, source } => {
            out.push_str("error: setup failed\n");
            let _ = writeln!(out, "  step:  {step}");
            let _ = writeln!(out, "  cause: {source}");
        }
        other => {
            let _ = writeln!(out, "error: {other}");
        }
    }
    if let Some(fix) = err.remediation() {
        let _ = writeln!(out, "  fix:   {fix}");
    }
    out
}

fn live_state(live: &[(u32, Option<ContainerState>)], index: u32) -> &'static str {
    match live.iter().find(|(i, _)| *i == index) {
        Some((_, Some(state))) => state.as_str(),
        Some((_, None)) => "missing",
        None => "unknown",
    }
}

pub fn render_workers(workers: &[WorkerRecord], live: &[(u32, Option<ContainerState>)]) -> String {
    if workers.is_empty() {
        return "no workers\n".to_string();
    }
    let width = workers
        .iter()
        .map(|w| w.container_name.len())
        .max()
        .unwrap_or(0)
        .max("CONTAINER".len());
    let mut out = String::new();
    let _ = writeln!(out, "{:<7}{:<width$}  {:<11}REGISTRATION", "INDEX", "CONTAINER", "STATE");
    for w in workers {
        let mut registration = w.registration.as_str().to_string();
        if w.removal_failed {
            registration.push_str(" (removal failed)");
        }
        let _ = writeln!(
            out,
            "{:<7}{:<width$}  {:<11}{}",
            w.index,
            w.container_name,
            live_state(live, w.index),
            registration
        );
    }
    out
}

pub fn render_status(status: &ClusterStatus) -> String {
    let state = &status.state;
    let mut out = String::new();
    row(
        &mut out,
        "runtime",
        if status.runtime_reachable { "reachable" } else { "unreachable" },
    );
    row(&mut out, "network", or_dash(state.network_id.as_deref()));
    row(&mut out, "volume", or_dash(state.volume_id.as_deref()));
    row(
        &mut out,
        "keys",
        or_dash(state.key_pair.as_ref().map(|k| k.fingerprint.as_str())),
    );
    row(&mut out, "tunnel", tunnel_line(&status.tunnel));
    match &state.coordinator {
        Some(record) => {
            let container = status
                .coordinator_container
                .map(ContainerState::as_str)
                .unwrap_or("missing");
            row(
                &mut out,
                "coordinator",
                format!("{} {} ({container})", record.container_name, record.status.as_str()),
            );
            if let Some(url) = &record.public_url {
                row(&mut out, "public url", url);
            }
            row(&mut out, "plugins", record.plugins.len());
        }
        None => row(&mut out, "coordinator", "-"),
    }
    row(
        &mut out,
        "last step",
        state
            .last_completed_step
            .map(|s| s.as_str())
            .unwrap_or("-"),
    );
    out.push('\n');
    out.push_str(&render_workers(&state.workers, &status.worker_containers));
    out
}

fn tunnel_line(tunnel: &TunnelStatus) -> String {
    match (tunnel.running, &tunnel.public_url) {
        (true, Some(url)) => url.clone(),
        (true, None) => "running (no url yet)".to_string(),
        (false, _) => "stopped".to_string(),
    }
}

pub fn render_tunnel(tunnel: &TunnelStatus) -> String {
    let mut out = String::new();
    row(&mut out, "tunnel", tunnel_line(tunnel));
    out
}

pub fn render_coordinator(report: &CoordinatorReport) -> String {
    let record = &report.record;
    let mut out = String::new();
    let container = report.container.map(ContainerState::as_str).unwrap_or("missing");
    row(&mut out, "container", format!("{} ({container})", record.container_name));
    row(&mut out, "status", record.status.as_str());
    let reach = if report.reachable { "reachable" } else { "unreachable" };
    row(&mut out, "local url", format!("{} ({reach})", report.local_url));
    row(&mut out, "public url", or_dash(record.public_url.as_deref()));
    row(&mut out, "admin", &record.admin.username);
    if record.plugins.is_empty() {
        row(&mut out, "plugins", "-");
    } else {
        row(&mut out, "plugins", record.plugins.join(", "));
    }
    out
}

pub fn render_install(result: &InstallResult) -> String {
    let mut out = String::new();
    let list = |names: &[String]| {
        if names.is_empty() {
            "-".to_string()
        } else {
            names.join(", ")
        }
    };
    row(&mut out, "installed", list(&result.installed));
    row(&mut out, "present", list(&result.already_present));
    if result.restarted {
        out.push_str("coordinator restarted to load plugins\n");
    }
    out
}

pub fn render_setup(report: &SetupReport) -> String {
    let mut out = String::new();
    row(
        &mut out,
        "coordinator",
        format!(
            "{} ({})",
            report.coordinator.container_name,
            report.coordinator.status.as_str()
        ),
    );
    if let Some(url) = &report.public_url {
        row(&mut out, "public url", url);
    }
    match &report.plugins {
        Some(result) if result.restarted => row(
            &mut out,
            "plugins",
            format!("{} installed, coordinator restarted", result.installed.len()),
        ),
        Some(result) => row(&mut out, "plugins", format!("{} installed", result.installed.len())),
        None => row(&mut out, "plugins", "already installed"),
    }
    let failed = report.failed_registrations();
    if failed.is_empty() {
        row(&mut out, "workers", report.workers.len());
    } else {
        let indices: Vec<String> = failed.iter().map(u32::to_string).collect();
        row(
            &mut out,
            "workers",
            format!(
                "{} (registration failed: {}; retry with `jenkins-local agent register INDEX`)",
                report.workers.len(),
                indices.join(", ")
            ),
        );
    }
    if !report.skipped.is_empty() {
        let skipped: Vec<&str> = report.skipped.iter().map(|s| s.as_str()).collect();
        row(&mut out, "skipped", skipped.join(", "));
    }
    out
}

/// One line per item: `verb item` on success, `failed item: error` otherwise.
pub fn render_batch<T: std::fmt::Display>(verb: &str, outcome: &BatchOutcome<T>) -> String {
    let mut out = String::new();
    for item in &outcome.succeeded {
        let _ = writeln!(out, "{verb} {item}");
    }
    for failure in &outcome.failed {
        let _ = writeln!(out, "failed {}: {}", failure.item, failure.error);
    }
    if outcome.succeeded.is_empty() && outcome.failed.is_empty() {
        out.push_str("nothing to do\n");
    }
    out
}
