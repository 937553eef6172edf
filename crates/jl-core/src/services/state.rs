use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ClusterError, Result};
use crate::models::{ClusterPaths, ClusterState, STATE_SCHEMA_VERSION};

use super::process::is_pid_alive;

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Contents of `state.lock`.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Removes the lock file when the update cycle ends, including on error.
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Owner of `state.json`. Every mutation goes through [`StateStore::update`]
/// or [`StateStore::try_update`], which serialize both across tasks in this
/// process and across concurrent CLI invocations.
pub struct StateStore {
    state_file_path: PathBuf,
    lock_file_path: PathBuf,
    in_process: Mutex<()>,
    lock_wait: Duration,
    stale_after: Duration,
}

impl StateStore {
    pub fn new(paths: &ClusterPaths) -> Self {
        Self {
            state_file_path: paths.state_file(),
            lock_file_path: paths.lock_file(),
            in_process: Mutex::new(()),
            lock_wait: DEFAULT_LOCK_WAIT,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_lock_timing(mut self, lock_wait: Duration, stale_after: Duration) -> Self {
        self.lock_wait = lock_wait;
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.state_file_path
    }

    /// Read the current state; an absent file is an empty cluster.
    pub async fn load(&self) -> Result<ClusterState> {
        if !self.state_file_path.exists() {
            return Ok(ClusterState::default());
        }
        let json = tokio::fs::read_to_string(&self.state_file_path)
            .await
            .map_err(|e| ClusterError::State(format!("failed to read state file: {e}")))?;
        if json.trim().is_empty() {
            return Ok(ClusterState::default());
        }
        let state: ClusterState =
            serde_json::from_str(&json).map_err(|e| ClusterError::StateCorrupt {
                path: self.state_file_path.clone(),
                reason: e.to_string(),
            })?;
        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(ClusterError::StateCorrupt {
                path: self.state_file_path.clone(),
                reason: format!(
                    "schema version {} is newer than supported version {STATE_SCHEMA_VERSION}",
                    state.schema_version
                ),
            });
        }
        Ok(state)
    }

    /// Acquire, load, mutate, persist, release. Returns the persisted state.
    pub async fn update<F>(&self, mutate: F) -> Result<ClusterState>
    where
        F: FnOnce(&mut ClusterState),
    {
        self.try_update(|state| {
            mutate(state);
            Ok(state.clone())
        })
        .await
    }

    /// Like [`StateStore::update`], but the mutator may fail, in which case
    /// nothing is written.
    pub async fn try_update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut ClusterState) -> Result<T>,
    {
        let _in_process = self.in_process.lock().await;
        let _lock = self.acquire_file_lock().await?;

        let mut state = self.load().await?;
        let value = mutate(&mut state)?;
        state.schema_version = STATE_SCHEMA_VERSION;
        self.save(&state).await?;
        Ok(value)
    }

    async fn save(&self, state: &ClusterState) -> Result<()> {
        if let Some(parent) = self.state_file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClusterError::State(format!("failed to create state dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.state_file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| ClusterError::State(format!("failed to write state file: {e}")))?;
        restrict_to_owner(&tmp_path).await?;
        tokio::fs::rename(&tmp_path, &self.state_file_path)
            .await
            .map_err(|e| ClusterError::State(format!("failed to replace state file: {e}")))?;
        Ok(())
    }

    async fn acquire_file_lock(&self) -> Result<LockFile> {
        if let Some(parent) = self.lock_file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClusterError::State(format!("failed to create state dir: {e}")))?;
        }
        let started = Instant::now();
        loop {
            let attempt = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_file_path);
            match attempt {
                Ok(file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let guard = LockFile {
                        path: self.lock_file_path.clone(),
                    };
                    serde_json::to_writer(file, &info)?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = self.read_lock_info();
                    if self.is_stale(holder.as_ref()) {
                        tracing::warn!(
                            path = %self.lock_file_path.display(),
                            holder_pid = holder.as_ref().map(|h| h.pid),
                            "reclaiming stale state lock"
                        );
                        self.reclaim(holder.as_ref())?;
                        continue;
                    }
                    if started.elapsed() >= self.lock_wait {
                        let (pid, since) = holder
                            .map(|h| (h.pid, h.acquired_at.to_rfc3339()))
                            .unwrap_or((0, "unknown".into()));
                        return Err(ClusterError::StateLocked { pid, since });
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(ClusterError::State(format!(
                        "failed to create lock file: {e}"
                    )))
                }
            }
        }
    }

    fn read_lock_info(&self) -> Option<LockInfo> {
        read_lock_info(&self.lock_file_path)
    }

    /// Move the stale lock aside and delete it. If what got moved is not
    /// the lock judged stale, another process reclaimed first and the file
    /// is its live lock, so it is linked back in place.
    fn reclaim(&self, stale: Option<&LockInfo>) -> Result<()> {
        let claimed = self
            .lock_file_path
            .with_extension(format!("lock.stale.{}", std::process::id()));
        match std::fs::rename(&self.lock_file_path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ClusterError::State(format!(
                    "failed to reclaim stale lock: {e}"
                )))
            }
        }
        if read_lock_info(&claimed).as_ref() != stale {
            tracing::debug!("state lock was reclaimed concurrently, restoring it");
            let _ = std::fs::hard_link(&claimed, &self.lock_file_path);
        }
        let _ = std::fs::remove_file(&claimed);
        Ok(())
    }

    fn is_stale(&self, holder: Option<&LockInfo>) -> bool {
        match holder {
            Some(info) => {
                let age = Utc::now()
                    .signed_duration_since(info.acquired_at)
                    .to_std()
                    .unwrap_or_default();
                !is_pid_alive(info.pid) || age > self.stale_after
            }
            // Unreadable lock: the writer may be mid-write, so only reclaim
            // once the file itself has aged past the stale threshold.
            None => std::fs::metadata(&self.lock_file_path)
                .and_then(|m| m.modified())
                .map(|modified| {
                    SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or_default()
                        > self.stale_after.min(Duration::from_secs(5))
                })
                .unwrap_or(false),
        }
    }
}

fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Restrict a file to the owning user (`0600`). No-op off Unix.
pub(crate) async fn restrict_to_owner(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::{ResourceLimits, SetupStep, WorkerRecord};

    fn store(dir: &Path) -> StateStore {
        StateStore::new(&ClusterPaths::new(dir))
    }

    fn worker(index: u32) -> WorkerRecord {
        WorkerRecord::new(index, format!("agent-{index}"), ResourceLimits::new("1g", "1"))
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = store(dir.path()).load().await.unwrap();
        assert_eq!(state, ClusterState::default());
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn update_persists_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let updated = store
            .update(|s| {
                s.network_id = Some("net-1".into());
                s.last_completed_step = Some(SetupStep::NetworkVolume);
            })
            .await
            .unwrap();
        assert_eq!(updated.network_id.as_deref(), Some("net-1"));

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded, updated);
        assert!(!dir.path().join("state.lock").exists());
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.update(|s| s.volume_id = Some("vol".into())).await.unwrap();

        let result: Result<()> = store
            .try_update(|s| {
                s.volume_id = None;
                Err(ClusterError::InvalidInput("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            store.load().await.unwrap().volume_id.as_deref(),
            Some("vol")
        );
    }

    #[tokio::test]
    async fn corrupt_state_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), "{ not json").unwrap();
        let err = store(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, ClusterError::StateCorrupt { .. }));

        let err = store(dir.path()).update(|_| {}).await.unwrap_err();
        assert!(matches!(err, ClusterError::StateCorrupt { .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("state.json")).unwrap(),
            "{ not json"
        );
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("state.json"),
            r#"{"schemaVersion": 99, "workers": []}"#,
        )
        .unwrap();
        let err = store(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, ClusterError::StateCorrupt { .. }));
    }

    #[tokio::test]
    async fn lock_of_dead_process_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("state.lock"),
            r#"{"pid": 0, "acquiredAt": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let store = store(dir.path());
        store.update(|s| s.network_id = Some("n".into())).await.unwrap();
        assert!(!dir.path().join("state.lock").exists());
    }

    #[test]
    fn old_lock_is_stale_even_if_holder_lives() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let old = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now() - chrono::Duration::minutes(11),
        };
        let fresh = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let dead = LockInfo {
            pid: 0,
            acquired_at: Utc::now(),
        };
        assert!(store.is_stale(Some(&old)));
        assert!(!store.is_stale(Some(&fresh)));
        assert!(store.is_stale(Some(&dead)));
    }

    #[test]
    fn reclaim_keeps_a_lock_taken_in_the_meantime() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let lock_path = dir.path().join("state.lock");
        let stale = LockInfo {
            pid: 0,
            acquired_at: Utc::now() - chrono::Duration::minutes(30),
        };
        // Another process already replaced the stale lock with its own.
        let live = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        std::fs::write(&lock_path, serde_json::to_string(&live).unwrap()).unwrap();

        store.reclaim(Some(&stale)).unwrap();
        assert_eq!(read_lock_info(&lock_path), Some(live));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        std::fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();
        store.reclaim(Some(&stale)).unwrap();
        assert!(!lock_path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // Already gone.
        store.reclaim(Some(&stale)).unwrap();
    }

    #[tokio::test]
    async fn live_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let holder = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        std::fs::write(
            dir.path().join("state.lock"),
            serde_json::to_string(&holder).unwrap(),
        )
        .unwrap();
        let store = store(dir.path())
            .with_lock_timing(Duration::from_millis(200), Duration::from_secs(600));

        let err = store.update(|_| {}).await.unwrap_err();
        match err {
            ClusterError::StateLocked { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("unexpected error: {other}"),
        }
        // Someone else's lock must survive our failed attempt.
        assert!(dir.path().join("state.lock").exists());
    }

    #[tokio::test]
    async fn concurrent_updates_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path()));

        let mut handles = Vec::new();
        for index in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.update(|s| s.upsert_worker(worker(index))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = store.load().await.unwrap();
        assert_eq!(state.workers.len(), 16);
        let indices: Vec<u32> = state.workers.iter().map(|w| w.index).collect();
        assert_eq!(indices, (0..16).collect::<Vec<_>>());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        store(dir.path()).update(|_| {}).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("state.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
