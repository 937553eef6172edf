use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::{ClusterError, Result};
use crate::models::{ClusterPaths, TunnelSession, TunnelStatus};

use super::ngrok::TunnelBackend;
use super::poll::{poll_until, Backoff, PollPolicy};
use super::state::{restrict_to_owner, StateStore};

const TOKEN_FILE: &str = "auth_token";
const LOG_FILE: &str = "ngrok.log";
const URL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct TunnelManager {
    backend: Arc<dyn TunnelBackend>,
    store: Arc<StateStore>,
    paths: ClusterPaths,
    timeout: Duration,
}

impl TunnelManager {
    pub fn new(
        backend: Arc<dyn TunnelBackend>,
        store: Arc<StateStore>,
        paths: ClusterPaths,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            paths,
            timeout,
        }
    }

    pub fn token_path(&self) -> PathBuf {
        self.paths.tunnel_dir().join(TOKEN_FILE)
    }

    pub fn is_authenticated(&self) -> bool {
        std::fs::read_to_string(self.token_path())
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }

    /// Persist the auth token (owner-only) for later `start` calls.
    pub async fn authenticate(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ClusterError::InvalidInput("tunnel auth token is empty".into()));
        }
        tokio::fs::create_dir_all(self.paths.tunnel_dir()).await?;
        let path = self.token_path();
        tokio::fs::write(&path, token).await?;
        restrict_to_owner(&path).await?;
        tracing::info!(path = %path.display(), "saved tunnel auth token");
        Ok(())
    }

    async fn read_token(&self) -> Result<String> {
        match tokio::fs::read_to_string(self.token_path()).await {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(ClusterError::TunnelNotAuthenticated),
        }
    }

    /// Bring a tunnel up to `port` and return its public URL. A live recorded
    /// session to the same port that already reports a URL is reused; one
    /// to another port is replaced.
    pub async fn start(&self, port: u16) -> Result<String> {
        let token = self.read_token().await?;

        let state = self.store.load().await?;
        if let Some(session) = state.tunnel {
            if session.target_port == port && self.backend.is_alive(session.pid) {
                if let Some(url) = self.backend.public_url().await {
                    tracing::debug!(pid = session.pid, %url, "tunnel already running");
                    return Ok(url);
                }
            }
            tracing::info!(
                pid = session.pid,
                from = session.target_port,
                to = port,
                "replacing tunnel session"
            );
            self.backend.terminate(session.pid);
            self.store.update(|s| s.tunnel = None).await?;
        }

        tokio::fs::create_dir_all(self.paths.tunnel_dir()).await?;
        let log_file = self.paths.tunnel_dir().join(LOG_FILE);
        let pid = self.backend.launch(&token, port, &log_file).await?;

        let policy = PollPolicy::new(Backoff::fixed(URL_POLL_INTERVAL), self.timeout);
        let backend = self.backend.clone();
        let url = poll_until(policy, || {
            let backend = backend.clone();
            async move { backend.public_url().await }
        })
        .await;

        let Some(url) = url else {
            self.backend.terminate(pid);
            return Err(ClusterError::TunnelTimeout(self.timeout.as_secs()));
        };

        let session = TunnelSession {
            pid,
            public_url: url.clone(),
            token_path: self.token_path(),
            target_port: port,
            started_at: Utc::now(),
        };
        self.store.update(|s| s.tunnel = Some(session)).await?;
        tracing::info!(pid, %url, port, "tunnel started");
        Ok(url)
    }

    /// Stop the recorded tunnel. Returns whether a session was recorded.
    pub async fn stop(&self) -> Result<bool> {
        let state = self.store.load().await?;
        let Some(session) = state.tunnel else {
            return Ok(false);
        };
        if self.backend.is_alive(session.pid) {
            self.backend.terminate(session.pid);
            tracing::info!(pid = session.pid, "tunnel stopped");
        }
        self.store.update(|s| s.tunnel = None).await?;
        Ok(true)
    }

    pub async fn status(&self) -> Result<TunnelStatus> {
        let state = self.store.load().await?;
        let running = state
            .tunnel
            .as_ref()
            .map(|s| self.backend.is_alive(s.pid))
            .unwrap_or(false);
        let public_url = if running {
            self.backend.public_url().await
        } else {
            None
        };
        Ok(TunnelStatus {
            running,
            public_url,
        })
    }
}
