//! Contract with the external migration service and its HTTP implementation.
//!
//! Every coordinator talks to the service through [`MigrationBackend`], so the
//! orchestrator can run against the real service or an in-process fake.

use crate::model::{DiskReport, Host, OsType, PowerState, VirtualMachine};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("{detail}")]
    Status { status: u16, detail: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl BackendError {
    /// Operator-facing text: the service's `detail` when it sent one.
    pub fn detail(&self) -> String {
        match self {
            BackendError::Status { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Host as the service expects it on the wire.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPayload {
    pub id: String,
    pub ip_address: String,
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub morpheus_fqdn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub morpheus_api_key: Option<String>,
}

impl From<&Host> for HostPayload {
    fn from(host: &Host) -> Self {
        Self {
            id: host.id.clone(),
            ip_address: host.address.clone(),
            username: host.username.clone(),
            password: host.password.clone().unwrap_or_default(),
            morpheus_fqdn: host.management.as_ref().map(|m| m.fqdn.clone()),
            morpheus_api_key: host.management.as_ref().map(|m| m.api_key.clone()),
        }
    }
}

impl fmt::Debug for HostPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPayload")
            .field("id", &self.id)
            .field("ip_address", &self.ip_address)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub clone_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl CloneResponse {
    pub fn already_exists(&self) -> bool {
        self.status.as_deref() == Some("already_exists")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskProgress {
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub state: String,
}

/// `{status, logs[, progress]}` report for preparation and migration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationReport {
    pub status: String,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatusReport {
    pub name: String,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub guest_os: Option<String>,
    #[serde(default)]
    pub os_type: OsType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSyncAction {
    Start,
    Stop,
    Logs,
}

impl LiveSyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveSyncAction::Start => "start",
            LiveSyncAction::Stop => "stop",
            LiveSyncAction::Logs => "logs",
        }
    }
}

#[derive(Clone, Serialize)]
pub struct LiveSyncRequest {
    pub source_ip: String,
    pub target_ip: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LiveSyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSyncRequest")
            .field("source_ip", &self.source_ip)
            .field("target_ip", &self.target_ip)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFlavor {
    Linux,
    Windows,
}

impl LogFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFlavor::Linux => "linux",
            LogFlavor::Windows => "windows",
        }
    }

    pub fn for_os(os_type: OsType) -> Self {
        if os_type == OsType::Windows {
            LogFlavor::Windows
        } else {
            LogFlavor::Linux
        }
    }
}

/// Generic `{status?, message?, logs?}` acknowledgement.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub logs: Option<String>,
}

#[derive(Clone, Serialize)]
pub struct AgentInstallRequest {
    pub api_key: String,
    pub vme_host: String,
    pub vm_name: String,
    pub vm_username: String,
    pub vm_password: String,
}

impl fmt::Debug for AgentInstallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInstallRequest")
            .field("vme_host", &self.vme_host)
            .field("vm_name", &self.vm_name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize)]
pub struct FileCheckHost {
    pub ip_address: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for FileCheckHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCheckHost")
            .field("ip_address", &self.ip_address)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShutdownResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ShutdownResponse {
    pub fn already_off(&self) -> bool {
        self.status.as_deref() == Some("already_off")
    }
}

#[derive(Clone, Serialize)]
pub struct IpReassignRequest {
    pub source_ip: String,
    pub target_ip: String,
    pub username: String,
    pub password: String,
    pub os_type: String,
}

impl fmt::Debug for IpReassignRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpReassignRequest")
            .field("source_ip", &self.source_ip)
            .field("target_ip", &self.target_ip)
            .field("os_type", &self.os_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpReassignResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub logs: Option<String>,
}

#[async_trait]
pub trait MigrationBackend: Send + Sync {
    async fn list_vms(&self, host: &Host) -> BackendResult<Vec<VirtualMachine>>;

    /// Binary pre-check document for the named VMs.
    async fn precheck_report(&self, host: &Host, vm_names: &[String]) -> BackendResult<Vec<u8>>;

    async fn start_clone(&self, host: &Host, vm_name: &str) -> BackendResult<CloneResponse>;

    /// Returns [`BackendError::NotFound`] when the task is gone.
    async fn task_progress(&self, host: &Host, task_id: &str) -> BackendResult<TaskProgress>;

    async fn prepare_for_target(&self, host: &Host, clone_name: &str) -> BackendResult<()>;

    async fn preparation_status(&self, clone_name: &str) -> BackendResult<OperationReport>;

    async fn create_target_vm(
        &self,
        source: &Host,
        target: &Host,
        clone_name: &str,
    ) -> BackendResult<()>;

    async fn migration_status(&self, clone_name: &str) -> BackendResult<OperationReport>;

    async fn check_vms(&self, host: &Host, vm_names: &[String])
    -> BackendResult<Vec<VmStatusReport>>;

    async fn live_sync(
        &self,
        action: LiveSyncAction,
        request: &LiveSyncRequest,
    ) -> BackendResult<ActionResult>;

    async fn start_windows_sync(&self, request: &LiveSyncRequest) -> BackendResult<ActionResult>;

    async fn live_sync_logs(
        &self,
        source_ip: &str,
        target_ip: &str,
        flavor: LogFlavor,
    ) -> BackendResult<String>;

    async fn install_agent(&self, request: &AgentInstallRequest) -> BackendResult<()>;

    /// Hostname to `success`/`failed`.
    async fn ping(&self, hostnames: &[String]) -> BackendResult<HashMap<String, String>>;

    /// Address to file count; negative counts mean the check failed on that host.
    async fn check_files(&self, hosts: &[FileCheckHost]) -> BackendResult<HashMap<String, i64>>;

    async fn check_files_windows(
        &self,
        hosts: &[FileCheckHost],
    ) -> BackendResult<HashMap<String, DiskReport>>;

    async fn shutdown_vm(&self, host: &Host, vm_name: &str) -> BackendResult<ShutdownResponse>;

    async fn reassign_ip(&self, request: &IpReassignRequest) -> BackendResult<IpReassignResponse>;

    async fn ip_reassignment_logs(&self, source_ip: &str) -> BackendResult<Vec<String>>;
}

/// [`MigrationBackend`] over HTTP/JSON.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, path: &str, request: reqwest::RequestBuilder) -> BackendResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = error_detail(&body).unwrap_or_else(|| format!("{} returned {}", path, status));
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(BackendError::NotFound(detail))
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
                detail,
            })
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> BackendResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .send(path, self.client.post(self.url(path)).json(body))
            .await?;
        decode(path, response).await
    }

    async fn post_unit<B>(&self, path: &str, body: &B) -> BackendResult<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.send(path, self.client.post(self.url(path)).json(body))
            .await
            .map(|_| ())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> BackendResult<T> {
        let response = self.send(path, self.client.get(self.url(path))).await?;
        decode(path, response).await
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> BackendResult<T> {
    response.json::<T>().await.map_err(|e| BackendError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// `detail` field of a `{"detail": ...}` error body.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Per-drive lines from the Windows check. A host-level `error` string becomes
/// a one-line entry under the `error` key.
fn disk_report_from_value(value: serde_json::Value) -> DiskReport {
    let mut report = DiskReport::new();
    if let serde_json::Value::Object(drives) = value {
        for (drive, lines) in drives {
            let lines = match lines {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    })
                    .collect(),
                serde_json::Value::String(text) => vec![text],
                other => vec![other.to_string()],
            };
            report.insert(drive, lines);
        }
    }
    report
}

#[derive(Serialize)]
struct HostRequest<'a> {
    host: HostPayload,
    #[serde(rename = "vmName")]
    vm_name: &'a str,
}

#[derive(Deserialize)]
struct LogsText {
    #[serde(default)]
    logs: String,
}

#[derive(Deserialize)]
struct LogsList {
    #[serde(default)]
    logs: Vec<String>,
}

#[async_trait]
impl MigrationBackend for HttpBackend {
    async fn list_vms(&self, host: &Host) -> BackendResult<Vec<VirtualMachine>> {
        self.post_json("/api/vms", &HostPayload::from(host)).await
    }

    async fn precheck_report(&self, host: &Host, vm_names: &[String]) -> BackendResult<Vec<u8>> {
        let path = "/api/precheck-report";
        let body = serde_json::json!({
            "host": HostPayload::from(host),
            "vmNames": vm_names,
        });
        let response = self
            .send(path, self.client.post(self.url(path)).json(&body))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn start_clone(&self, host: &Host, vm_name: &str) -> BackendResult<CloneResponse> {
        let body = HostRequest {
            host: HostPayload::from(host),
            vm_name,
        };
        self.post_json("/api/vms/clone", &body).await
    }

    async fn task_progress(&self, host: &Host, task_id: &str) -> BackendResult<TaskProgress> {
        let path = format!("/api/tasks/{}", task_id);
        self.post_json(&path, &HostPayload::from(host)).await
    }

    async fn prepare_for_target(&self, host: &Host, clone_name: &str) -> BackendResult<()> {
        let body = serde_json::json!({
            "host": HostPayload::from(host),
            "cloneVmName": clone_name,
        });
        self.post_unit("/api/vms/prepare-for-target", &body).await
    }

    async fn preparation_status(&self, clone_name: &str) -> BackendResult<OperationReport> {
        self.get_json(&format!("/api/vms/preparation-status/{}", clone_name))
            .await
    }

    async fn create_target_vm(
        &self,
        source: &Host,
        target: &Host,
        clone_name: &str,
    ) -> BackendResult<()> {
        let body = serde_json::json!({
            "sourceHost": HostPayload::from(source),
            "targetHost": HostPayload::from(target),
            "cloneVmName": clone_name,
        });
        self.post_unit("/api/vms/create-target-vm", &body).await
    }

    async fn migration_status(&self, clone_name: &str) -> BackendResult<OperationReport> {
        self.get_json(&format!("/api/vms/migration-status/{}", clone_name))
            .await
    }

    async fn check_vms(
        &self,
        host: &Host,
        vm_names: &[String],
    ) -> BackendResult<Vec<VmStatusReport>> {
        let body = serde_json::json!({
            "host": HostPayload::from(host),
            "vm_names": vm_names,
        });
        self.post_json("/api/vms/replication/check-vms", &body).await
    }

    async fn live_sync(
        &self,
        action: LiveSyncAction,
        request: &LiveSyncRequest,
    ) -> BackendResult<ActionResult> {
        let path = format!("/api/vms/replication/{}", action.as_str());
        self.post_json(&path, request).await
    }

    async fn start_windows_sync(&self, request: &LiveSyncRequest) -> BackendResult<ActionResult> {
        self.post_json("/api/vms/replication/start-windows-sync", request)
            .await
    }

    async fn live_sync_logs(
        &self,
        source_ip: &str,
        target_ip: &str,
        flavor: LogFlavor,
    ) -> BackendResult<String> {
        let path = format!(
            "/api/vms/replication/logs/{}/{}?os_type={}",
            source_ip,
            target_ip,
            flavor.as_str()
        );
        let logs: LogsText = self.get_json(&path).await?;
        Ok(logs.logs)
    }

    async fn install_agent(&self, request: &AgentInstallRequest) -> BackendResult<()> {
        self.post_unit("/api/vms/install-morpheus-agent", request)
            .await
    }

    async fn ping(&self, hostnames: &[String]) -> BackendResult<HashMap<String, String>> {
        let body = serde_json::json!({ "hostnames": hostnames });
        self.post_json("/api/vms/ping-test", &body).await
    }

    async fn check_files(&self, hosts: &[FileCheckHost]) -> BackendResult<HashMap<String, i64>> {
        let body = serde_json::json!({ "hosts": hosts });
        self.post_json("/api/vms/check-files", &body).await
    }

    async fn check_files_windows(
        &self,
        hosts: &[FileCheckHost],
    ) -> BackendResult<HashMap<String, DiskReport>> {
        let body = serde_json::json!({ "hosts": hosts });
        let raw: HashMap<String, serde_json::Value> = self
            .post_json("/api/vms/check-files-windows", &body)
            .await?;
        Ok(raw
            .into_iter()
            .map(|(address, value)| (address, disk_report_from_value(value)))
            .collect())
    }

    async fn shutdown_vm(&self, host: &Host, vm_name: &str) -> BackendResult<ShutdownResponse> {
        let body = HostRequest {
            host: HostPayload::from(host),
            vm_name,
        };
        self.post_json("/api/vms/shutdown", &body).await
    }

    async fn reassign_ip(&self, request: &IpReassignRequest) -> BackendResult<IpReassignResponse> {
        self.post_json("/api/vms/reassign-ip", request).await
    }

    async fn ip_reassignment_logs(&self, source_ip: &str) -> BackendResult<Vec<String>> {
        let logs: LogsList = self
            .get_json(&format!("/api/vms/reassign-ip/logs/{}", source_ip))
            .await?;
        Ok(logs.logs)
    }
}
