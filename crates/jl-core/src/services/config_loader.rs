use crate::error::{ClusterError, Result};
use crate::models::{ClusterConfig, ClusterPaths};

/// Load `config.yaml` from the tool directory, falling back to defaults
/// when it does not exist.
pub fn load(paths: &ClusterPaths) -> Result<ClusterConfig> {
    let config_path = paths.config_file();
    if !config_path.exists() {
        return Ok(ClusterConfig::default());
    }
    let contents = std::fs::read_to_string(&config_path)?;
    if contents.trim().is_empty() {
        return Ok(ClusterConfig::default());
    }
    let config: ClusterConfig =
        serde_yaml::from_str(&contents).map_err(|e| ClusterError::InvalidConfig {
            path: config_path.clone(),
            reason: e.to_string(),
        })?;
    validate(&config).map_err(|reason| ClusterError::InvalidConfig {
        path: config_path,
        reason,
    })?;
    Ok(config)
}

fn validate(config: &ClusterConfig) -> std::result::Result<(), String> {
    if config.network.is_empty() || config.volume.is_empty() {
        return Err("network and volume names are required".into());
    }
    if config.coordinator.container_name.is_empty() || config.agent.container_prefix.is_empty() {
        return Err("container names are required".into());
    }
    if config.agent.max_parallel == 0 {
        return Err("agent.max_parallel must be at least 1".into());
    }
    if config.retry.max_attempts == 0 {
        return Err("retry.max_attempts must be at least 1".into());
    }
    Ok(())
}
