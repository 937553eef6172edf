use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::models::{AdminCredentials, InstallResult, PluginSpec};

use super::coordinator::CoordinatorController;
use super::jenkins::{InstalledPlugin, JobState, ManagementApi, UpdateCenterStatus};
use super::poll::{poll_until, retry_transient, Backoff, PollPolicy, RetryPolicy};
use super::state::StateStore;

/// Timeouts the installer waits against.
#[derive(Debug, Clone, Copy)]
pub struct PluginTimeouts {
    pub install: Duration,
    pub restart_down: Duration,
    pub readiness: Duration,
}

pub struct PluginInstaller {
    api: Arc<dyn ManagementApi>,
    coordinator: Arc<CoordinatorController>,
    store: Arc<StateStore>,
    retry: RetryPolicy,
    timeouts: PluginTimeouts,
}

impl PluginInstaller {
    pub fn new(
        api: Arc<dyn ManagementApi>,
        coordinator: Arc<CoordinatorController>,
        store: Arc<StateStore>,
        retry: RetryPolicy,
        timeouts: PluginTimeouts,
    ) -> Self {
        Self {
            api,
            coordinator,
            store,
            retry,
            timeouts,
        }
    }

    async fn installed(&self, admin: &AdminCredentials) -> Result<BTreeMap<String, InstalledPlugin>> {
        let plugins = retry_transient(&self.retry, "read installed plugins", || {
            self.api.installed_plugins(admin)
        })
        .await?;
        Ok(plugins
            .into_iter()
            .map(|p| (p.short_name.clone(), p))
            .collect())
    }

    /// Make sure every spec is installed at an acceptable version, restarting
    /// the coordinator if the update center asks for it.
    pub async fn install(&self, specs: &[PluginSpec]) -> Result<InstallResult> {
        let admin = self.coordinator.admin().await?;
        let before = self.installed(&admin).await?;

        let mut result = InstallResult::default();
        let mut needed: Vec<String> = Vec::new();
        for spec in specs {
            match before.get(spec.name) {
                Some(p) if p.active && spec.accepts(&p.version) => {
                    result.already_present.push(spec.name.to_string())
                }
                _ => needed.push(spec.name.to_string()),
            }
        }

        if needed.is_empty() {
            tracing::info!(count = result.already_present.len(), "all required plugins already installed");
            self.record(&result.all_names()).await?;
            return Ok(result);
        }

        tracing::info!(plugins = ?needed, "installing plugins");
        retry_transient(&self.retry, "submit plugin install", || {
            self.api.install_plugins(&admin, &needed)
        })
        .await?;

        let status = self.wait_for_jobs(&admin, &needed).await?;
        let mut failed: Vec<(String, String)> = Vec::new();
        for name in &needed {
            match last_job_state(&status, name) {
                Some((JobState::Succeeded, _)) => result.installed.push(name.clone()),
                Some((_, error)) => failed.push((
                    name.clone(),
                    error.unwrap_or_else(|| "installation failed".into()),
                )),
                None => failed.push((name.clone(), "no installation job was created".into())),
            }
        }

        if result.installed.is_empty() {
            return Err(ClusterError::PluginInstallRejected(describe(&failed)));
        }

        if status.restart_required {
            self.restart(&admin).await?;
            result.restarted = true;
        }

        // Versions are only authoritative once the plugins are loaded.
        let after = self.installed(&admin).await?;
        for spec in specs {
            let Some(min) = spec.min_version else { continue };
            if !result.installed.iter().any(|n| n == spec.name) {
                continue;
            }
            if let Some(p) = after.get(spec.name) {
                if !spec.accepts(&p.version) {
                    result.installed.retain(|n| n != spec.name);
                    failed.push((
                        spec.name.to_string(),
                        format!("version {} is below required {min}", p.version),
                    ));
                }
            }
        }

        self.record(&result.all_names()).await?;

        if !failed.is_empty() {
            return Err(ClusterError::PartialInstall {
                installed: result.installed,
                failed,
            });
        }
        tracing::info!(installed = ?result.installed, restarted = result.restarted, "plugins installed");
        Ok(result)
    }

    async fn wait_for_jobs(&self, admin: &AdminCredentials, needed: &[String]) -> Result<UpdateCenterStatus> {
        let policy = PollPolicy::new(
            Backoff::exponential(Duration::from_secs(1), Duration::from_secs(5)),
            self.timeouts.install,
        );
        let outcome = poll_until(policy, || async {
            match self.api.update_center(admin).await {
                Ok(status) => {
                    let done = needed.iter().all(|name| {
                        matches!(
                            last_job_state(&status, name),
                            Some((JobState::Succeeded | JobState::Failed, _))
                        )
                    });
                    done.then_some(Ok(status))
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "update center unavailable, polling again");
                    None
                }
                Err(e) => Some(Err(e)),
            }
        })
        .await;

        match outcome {
            Some(result) => result,
            None => Err(ClusterError::PluginInstallTimeout(self.timeouts.install.as_secs())),
        }
    }

    async fn restart(&self, admin: &AdminCredentials) -> Result<()> {
        tracing::info!("plugins require a restart, restarting coordinator");
        retry_transient(&self.retry, "safe restart", || self.api.safe_restart(admin)).await?;
        if !self.coordinator.wait_down(self.timeouts.restart_down).await {
            tracing::warn!("coordinator never stopped answering after restart request");
        }
        self.coordinator.wait_ready(self.timeouts.readiness).await
    }

    async fn record(&self, names: &[String]) -> Result<()> {
        let names = names.to_vec();
        self.store
            .update(|s| {
                if let Some(record) = s.coordinator.as_mut() {
                    let mut merged: BTreeSet<String> = record.plugins.drain(..).collect();
                    merged.extend(names);
                    record.plugins = merged.into_iter().collect();
                }
            })
            .await?;
        Ok(())
    }
}

/// State of the most recent job for `plugin`; the update center keeps old jobs.
fn last_job_state(status: &UpdateCenterStatus, plugin: &str) -> Option<(JobState, Option<String>)> {
    status
        .jobs
        .iter()
        .rev()
        .find(|j| j.plugin == plugin)
        .map(|j| (j.state, j.error.clone()))
}

fn describe(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}
