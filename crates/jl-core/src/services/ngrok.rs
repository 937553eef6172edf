use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ClusterError, Result};

use super::process::{is_pid_alive, kill_pid, spawn_detached};

/// A process that relays a local port to a public URL.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Launch the relay detached and return its pid.
    async fn launch(&self, token: &str, port: u16, log_file: &Path) -> Result<u32>;
    /// The public https URL, once the relay reports one.
    async fn public_url(&self) -> Option<String>;
    fn is_alive(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32);
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Deserialize)]
struct TunnelEntry {
    #[serde(default)]
    proto: String,
    #[serde(default)]
    public_url: String,
}

/// Pick the https tunnel's URL out of an inspection API `/tunnels` body.
pub fn https_url(body: &str) -> Option<String> {
    let list: TunnelList = serde_json::from_str(body).ok()?;
    list.tunnels
        .into_iter()
        .find(|t| t.proto == "https" && !t.public_url.is_empty())
        .map(|t| t.public_url)
}

/// [`TunnelBackend`] driving the `ngrok` binary and its local inspection API.
pub struct NgrokCli {
    binary: String,
    api_url: String,
    http: reqwest::Client,
}

impl NgrokCli {
    pub fn new(binary: impl Into<String>, api_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| ClusterError::Tunnel(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            binary: binary.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl TunnelBackend for NgrokCli {
    async fn launch(&self, token: &str, port: u16, log_file: &Path) -> Result<u32> {
        let args = vec![
            "http".to_string(),
            port.to_string(),
            "--log".into(),
            log_file.to_string_lossy().to_string(),
            "--log-format".into(),
            "json".into(),
            "--log-level".into(),
            "info".into(),
        ];
        // Token goes through the environment so it never shows up in `ps`.
        let envs = vec![("NGROK_AUTHTOKEN".to_string(), token.to_string())];
        let pid = spawn_detached(&self.binary, &args, &envs, log_file.parent())?;
        tracing::debug!(pid, port, "ngrok launched");
        Ok(pid)
    }

    async fn public_url(&self) -> Option<String> {
        let response = self
            .http
            .get(format!("{}/tunnels", self.api_url))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        https_url(&body)
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }

    fn terminate(&self, pid: u32) {
        kill_pid(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_https_tunnel() {
        let body = r#"{"tunnels":[
            {"name":"command_line (http)","proto":"http","public_url":"http://abc.ngrok.io"},
            {"name":"command_line","proto":"https","public_url":"https://abc.ngrok.io"}
        ],"uri":"/api/tunnels"}"#;
        assert_eq!(https_url(body), Some("https://abc.ngrok.io".into()));
    }

    #[test]
    fn no_tunnel_yet() {
        assert_eq!(https_url(r#"{"tunnels":[]}"#), None);
        assert_eq!(https_url("not json"), None);
    }

    #[tokio::test]
    async fn unreachable_api_reports_no_url() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let ngrok = NgrokCli::new("ngrok", format!("http://{addr}/api")).unwrap();
        assert_eq!(ngrok.public_url().await, None);
    }
}
