use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ClusterError, Result};
use crate::models::AdminCredentials;

/// Credential id the SSH launcher of every worker node references.
pub const SSH_CREDENTIAL_ID: &str = "jenkins-agent-ssh-key";
/// Account the worker image creates and accepts the key for.
pub const SSH_USERNAME: &str = "jenkins";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub short_name: String,
    pub version: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Succeeded,
    Failed,
}

/// One plugin download/install job from the update center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallJob {
    pub plugin: String,
    pub state: JobState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateCenterStatus {
    pub jobs: Vec<InstallJob>,
    pub restart_required: bool,
}

/// What the coordinator needs to launch an SSH agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub label: String,
    pub remote_fs: String,
    pub executors: u32,
    pub credential_id: String,
}

/// The coordinator's HTTP management API, as far as provisioning needs it.
///
/// Connection failures and 5xx responses surface as `TransientService` so
/// callers can wrap calls in `retry_transient`; 401/403 surface as
/// `AuthRejected`.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Unauthenticated liveness probe; any transport or HTTP failure is `false`.
    async fn is_up(&self) -> bool;

    async fn installed_plugins(&self, admin: &AdminCredentials) -> Result<Vec<InstalledPlugin>>;
    async fn install_plugins(&self, admin: &AdminCredentials, names: &[String]) -> Result<()>;
    async fn update_center(&self, admin: &AdminCredentials) -> Result<UpdateCenterStatus>;
    async fn safe_restart(&self, admin: &AdminCredentials) -> Result<()>;

    /// Run a Groovy script through the script console and return its output.
    async fn run_script(&self, admin: &AdminCredentials, script: &str) -> Result<String>;

    async fn credential_exists(&self, admin: &AdminCredentials, id: &str) -> Result<bool>;
    async fn create_ssh_credential(
        &self,
        admin: &AdminCredentials,
        id: &str,
        username: &str,
        private_key: &str,
    ) -> Result<()>;

    async fn node_exists(&self, admin: &AdminCredentials, name: &str) -> Result<bool>;
    async fn create_node(&self, admin: &AdminCredentials, node: &NodeSpec) -> Result<()>;
    /// Deleting an absent node is not an error.
    async fn delete_node(&self, admin: &AdminCredentials, name: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb_request_field: String,
    crumb: String,
}

#[derive(Debug, Deserialize)]
struct PluginList {
    #[serde(default)]
    plugins: Vec<InstalledPlugin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCenterResponse {
    #[serde(default)]
    jobs: Vec<RawJob>,
    #[serde(default)]
    restart_required_for_completion: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJob {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<RawJobStatus>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawJobStatus {
    #[serde(rename = "_class", default)]
    class: String,
}

#[derive(Debug, Deserialize)]
struct CredentialList {
    #[serde(default)]
    credentials: Vec<CredentialId>,
}

#[derive(Debug, Deserialize)]
struct CredentialId {
    id: String,
}

/// Classify an update-center job status by its Java class name, e.g.
/// `hudson.model.UpdateCenter$DownloadJob$SuccessButRequiresRestart`.
pub fn classify_job_status(class: &str) -> JobState {
    let tail = class.rsplit('$').next().unwrap_or(class);
    if tail.starts_with("Success") || tail == "Skipped" {
        JobState::Succeeded
    } else if tail == "Failure" {
        JobState::Failed
    } else {
        JobState::Pending
    }
}

/// [`ManagementApi`] over the Jenkins REST endpoints.
pub struct JenkinsClient {
    http: Client,
    base_url: String,
}

impl JenkinsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ClusterError::Api(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, admin: &AdminCredentials, path: &str) -> RequestBuilder {
        self.http
            .get(self.url(path))
            .basic_auth(&admin.username, Some(&admin.password))
    }

    /// POST with the CSRF crumb attached, when the coordinator issues one.
    async fn post(&self, admin: &AdminCredentials, path: &str) -> Result<RequestBuilder> {
        let mut request = self
            .http
            .post(self.url(path))
            .basic_auth(&admin.username, Some(&admin.password));
        if let Some(crumb) = self.crumb(admin).await? {
            request = request.header(crumb.crumb_request_field, crumb.crumb);
        }
        Ok(request)
    }

    async fn crumb(&self, admin: &AdminCredentials) -> Result<Option<Crumb>> {
        let response = send(self.get(admin, "/crumbIssuer/api/json")).await?;
        if response.status() == StatusCode::NOT_FOUND {
            // CSRF protection disabled.
            return Ok(None);
        }
        let response = check(response).await?;
        let crumb = response
            .json::<Crumb>()
            .await
            .map_err(|e| ClusterError::Api(format!("malformed crumb response: {e}")))?;
        Ok(Some(crumb))
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    request.send().await.map_err(|e| {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            ClusterError::TransientService(e.to_string())
        } else {
            ClusterError::Api(e.to_string())
        }
    })
}

/// Map non-success statuses onto the error taxonomy. Redirects count as
/// success: the form endpoints answer a successful POST with 302.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ClusterError::AuthRejected(format!("{url}: HTTP {status}"))
        }
        s if s.is_server_error() => ClusterError::TransientService(format!("{url}: HTTP {status}")),
        _ => ClusterError::Api(format!("{url}: HTTP {status}: {excerpt}")),
    })
}

fn node_path(name: &str) -> String {
    format!("/computer/{}", urlencoding::encode(name))
}

/// Form JSON for `/computer/doCreateItem` describing a permanent SSH agent.
pub fn node_form_json(node: &NodeSpec) -> serde_json::Value {
    json!({
        "name": node.name,
        "nodeDescription": format!("jenkins-local worker {}", node.name),
        "numExecutors": node.executors.to_string(),
        "remoteFS": node.remote_fs,
        "labelString": node.label,
        "mode": "NORMAL",
        "": ["hudson.plugins.sshslaves.SSHLauncher", "hudson.slaves.RetentionStrategy$Always"],
        "launcher": {
            "stapler-class": "hudson.plugins.sshslaves.SSHLauncher",
            "$class": "hudson.plugins.sshslaves.SSHLauncher",
            "host": node.host,
            "port": node.port.to_string(),
            "credentialsId": node.credential_id,
            "launchTimeoutSeconds": "60",
            "maxNumRetries": "10",
            "retryWaitTime": "15",
            "sshHostKeyVerificationStrategy": {
                "stapler-class": "hudson.plugins.sshslaves.verifiers.NonVerifyingKeyVerificationStrategy",
                "$class": "hudson.plugins.sshslaves.verifiers.NonVerifyingKeyVerificationStrategy"
            }
        },
        "retentionStrategy": {
            "stapler-class": "hudson.slaves.RetentionStrategy$Always",
            "$class": "hudson.slaves.RetentionStrategy$Always"
        },
        "nodeProperties": { "stapler-class-bag": "true" },
        "type": "hudson.slaves.DumbSlave"
    })
}

fn credential_form_json(id: &str, username: &str, private_key: &str) -> serde_json::Value {
    const KEY_CLASS: &str = "com.cloudbees.jenkins.plugins.sshcredentials.impl.BasicSSHUserPrivateKey";
    json!({
        "": "0",
        "credentials": {
            "scope": "GLOBAL",
            "id": id,
            "username": username,
            "description": "SSH key for jenkins-local workers",
            "privateKeySource": {
                "value": "0",
                "privateKey": private_key,
                "stapler-class": format!("{KEY_CLASS}$DirectEntryPrivateKeySource")
            },
            "stapler-class": KEY_CLASS,
            "$class": KEY_CLASS
        }
    })
}

const CREDENTIALS_STORE: &str = "/manage/credentials/store/system/domain/_";

#[async_trait]
impl ManagementApi for JenkinsClient {
    async fn is_up(&self) -> bool {
        match self.http.get(self.url("/login")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn installed_plugins(&self, admin: &AdminCredentials) -> Result<Vec<InstalledPlugin>> {
        let request = self
            .get(admin, "/pluginManager/api/json")
            .query(&[("depth", "1"), ("tree", "plugins[shortName,version,active]")]);
        let response = check(send(request).await?).await?;
        let list = response
            .json::<PluginList>()
            .await
            .map_err(|e| ClusterError::Api(format!("malformed plugin list: {e}")))?;
        Ok(list.plugins)
    }

    async fn install_plugins(&self, admin: &AdminCredentials, names: &[String]) -> Result<()> {
        let plugins: Vec<String> = names.iter().map(|n| format!("{n}@latest")).collect();
        let request = self
            .post(admin, "/pluginManager/installPlugins")
            .await?
            .json(&json!({ "dynamicLoad": true, "plugins": plugins }));
        let response = send(request).await?;
        if response.status() == StatusCode::BAD_REQUEST || response.status() == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(ClusterError::PluginInstallRejected(body.chars().take(200).collect()));
        }
        check(response).await?;
        Ok(())
    }

    async fn update_center(&self, admin: &AdminCredentials) -> Result<UpdateCenterStatus> {
        let request = self.get(admin, "/updateCenter/api/json").query(&[("depth", "2")]);
        let response = check(send(request).await?).await?;
        let raw = response
            .json::<UpdateCenterResponse>()
            .await
            .map_err(|e| ClusterError::Api(format!("malformed update center status: {e}")))?;
        let jobs = raw
            .jobs
            .into_iter()
            .filter_map(|job| {
                let plugin = job.name?;
                let state = job
                    .status
                    .map(|s| classify_job_status(&s.class))
                    .unwrap_or(JobState::Pending);
                Some(InstallJob {
                    plugin,
                    state,
                    error: job.error_message,
                })
            })
            .collect();
        Ok(UpdateCenterStatus {
            jobs,
            restart_required: raw.restart_required_for_completion,
        })
    }

    async fn safe_restart(&self, admin: &AdminCredentials) -> Result<()> {
        let request = self.post(admin, "/safeRestart").await?;
        match send(request).await {
            // The coordinator may drop the connection or answer 503 while going down.
            Err(ClusterError::TransientService(_)) => Ok(()),
            Err(e) => Err(e),
            Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => Ok(()),
            Ok(response) => check(response).await.map(|_| ()),
        }
    }

    async fn run_script(&self, admin: &AdminCredentials, script: &str) -> Result<String> {
        let request = self.post(admin, "/scriptText").await?.form(&[("script", script)]);
        let response = check(send(request).await?).await?;
        response
            .text()
            .await
            .map_err(|e| ClusterError::Api(format!("failed to read script output: {e}")))
    }

    async fn credential_exists(&self, admin: &AdminCredentials, id: &str) -> Result<bool> {
        let request = self
            .get(admin, &format!("{CREDENTIALS_STORE}/api/json"))
            .query(&[("tree", "credentials[id]")]);
        let response = send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let list = check(response)
            .await?
            .json::<CredentialList>()
            .await
            .map_err(|e| ClusterError::Api(format!("malformed credential list: {e}")))?;
        Ok(list.credentials.iter().any(|c| c.id == id))
    }

    async fn create_ssh_credential(
        &self,
        admin: &AdminCredentials,
        id: &str,
        username: &str,
        private_key: &str,
    ) -> Result<()> {
        let payload = credential_form_json(id, username, private_key).to_string();
        let request = self
            .post(admin, &format!("{CREDENTIALS_STORE}/createCredentials"))
            .await?
            .form(&[("json", payload.as_str()), ("Submit", "OK")]);
        check(send(request).await?).await?;
        if !self.credential_exists(admin, id).await? {
            return Err(ClusterError::Api(format!(
                "credential '{id}' not found after creation"
            )));
        }
        Ok(())
    }

    async fn node_exists(&self, admin: &AdminCredentials, name: &str) -> Result<bool> {
        let request = self.get(admin, &format!("{}/api/json", node_path(name)));
        let response = send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    async fn create_node(&self, admin: &AdminCredentials, node: &NodeSpec) -> Result<()> {
        let payload = node_form_json(node).to_string();
        let request = self.post(admin, "/computer/doCreateItem").await?.form(&[
            ("name", node.name.as_str()),
            ("type", "hudson.slaves.DumbSlave"),
            ("json", payload.as_str()),
        ]);
        check(send(request).await?).await?;
        Ok(())
    }

    async fn delete_node(&self, admin: &AdminCredentials, name: &str) -> Result<()> {
        let request = self.post(admin, &format!("{}/doDelete", node_path(name))).await?;
        let response = send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}
