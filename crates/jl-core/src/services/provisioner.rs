use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::error::{ClusterError, Result};
use crate::models::{ClusterConfig, ClusterPaths};

use super::runtime::{ContainerRuntime, Mount};
use super::state::StateStore;

const ARCHIVE_IMAGE: &str = "alpine";

/// Shared network and volume every cluster container attaches to.
pub struct ResourceProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<StateStore>,
    config: Arc<ClusterConfig>,
    paths: ClusterPaths,
}

/// Identifiers of the shared resources after `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedResources {
    pub network_id: String,
    pub volume_id: String,
}

impl ResourceProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<StateStore>,
        config: Arc<ClusterConfig>,
        paths: ClusterPaths,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
            paths,
        }
    }

    pub async fn ensure_network(&self) -> Result<String> {
        let name = &self.config.network;
        let id = match self.runtime.find_network(name).await? {
            Some(id) => {
                tracing::debug!(network = %name, %id, "network already exists");
                id
            }
            None => {
                let id = self.runtime.create_network(name).await?;
                tracing::info!(network = %name, %id, "created network");
                id
            }
        };
        let recorded = id.clone();
        self.store.update(|s| s.network_id = Some(recorded)).await?;
        Ok(id)
    }

    pub async fn ensure_volume(&self) -> Result<String> {
        let name = &self.config.volume;
        let id = match self.runtime.find_volume(name).await? {
            Some(id) => {
                tracing::debug!(volume = %name, "volume already exists");
                id
            }
            None => {
                let id = self.runtime.create_volume(name).await?;
                tracing::info!(volume = %name, "created volume");
                id
            }
        };
        let recorded = id.clone();
        self.store.update(|s| s.volume_id = Some(recorded)).await?;
        Ok(id)
    }

    /// Ping the runtime, then make sure both shared resources exist.
    pub async fn init(&self) -> Result<SharedResources> {
        self.runtime.ping().await?;
        let network_id = self.ensure_network().await?;
        let volume_id = self.ensure_volume().await?;
        Ok(SharedResources {
            network_id,
            volume_id,
        })
    }

    /// Remove the network and volume. Refuses while any container still
    /// uses either one.
    pub async fn teardown(&self) -> Result<()> {
        let users = self
            .runtime
            .containers_using(&self.config.network, &self.config.volume)
            .await?;
        if !users.is_empty() {
            return Err(ClusterError::ResourceInUse {
                resource: format!("network {} / volume {}", self.config.network, self.config.volume),
                users,
            });
        }
        self.runtime.remove_network(&self.config.network).await?;
        self.runtime.remove_volume(&self.config.volume).await?;
        self.store
            .update(|s| {
                s.network_id = None;
                s.volume_id = None;
            })
            .await?;
        tracing::info!(network = %self.config.network, volume = %self.config.volume, "removed shared resources");
        Ok(())
    }

    /// Archive the shared volume into a gzipped tarball. Without an explicit
    /// target, a timestamped file under the backups directory is used.
    pub async fn backup_volume(&self, target: Option<&Path>) -> Result<PathBuf> {
        self.require_volume().await?;
        let target = match target {
            Some(path) => absolute(path)?,
            None => self.paths.backups_dir().join(format!(
                "{}-{}.tar.gz",
                self.config.volume,
                Utc::now().format("%Y%m%d-%H%M%S")
            )),
        };
        let (dir, file_name) = split_archive_path(&target)?;
        tokio::fs::create_dir_all(&dir).await?;

        let mounts = [
            Mount::new(self.config.volume.clone(), "/source").read_only(),
            Mount::new(dir.to_string_lossy(), "/backup"),
        ];
        let archive = format!("/backup/{file_name}");
        let command: Vec<String> = ["tar", "czf", archive.as_str(), "-C", "/source", "."]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.runtime.run_oneshot(ARCHIVE_IMAGE, &mounts, &command).await?;
        tracing::info!(volume = %self.config.volume, path = %target.display(), "volume backed up");
        Ok(target)
    }

    /// Unpack a tarball made by [`ResourceProvisioner::backup_volume`] into
    /// the shared volume.
    pub async fn restore_volume(&self, source: &Path) -> Result<()> {
        if !source.is_file() {
            return Err(ClusterError::InvalidInput(format!(
                "backup file {} does not exist",
                source.display()
            )));
        }
        self.require_volume().await?;
        let source = absolute(source)?;
        let (dir, file_name) = split_archive_path(&source)?;

        let mounts = [
            Mount::new(self.config.volume.clone(), "/target"),
            Mount::new(dir.to_string_lossy(), "/backup").read_only(),
        ];
        let archive = format!("/backup/{file_name}");
        let command: Vec<String> = ["tar", "xzf", archive.as_str(), "-C", "/target"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.runtime.run_oneshot(ARCHIVE_IMAGE, &mounts, &command).await?;
        tracing::info!(volume = %self.config.volume, path = %source.display(), "volume restored");
        Ok(())
    }

    async fn require_volume(&self) -> Result<()> {
        if self.runtime.find_volume(&self.config.volume).await?.is_none() {
            return Err(ClusterError::PrerequisiteMissing(format!(
                "volume {} does not exist",
                self.config.volume
            )));
        }
        Ok(())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn split_archive_path(path: &Path) -> Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ClusterError::InvalidInput(format!("{} is not a file path", path.display())))?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((dir, file_name))
}
