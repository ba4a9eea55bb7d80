use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Placeholder the discovery backend uses for unknown addresses and hostnames.
pub const NOT_AVAILABLE: &str = "N/A";

/// Remote-management endpoint of a target host, used for agent installation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementEndpoint {
    pub fqdn: String,
    pub api_key: String,
}

impl fmt::Debug for ManagementEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementEndpoint")
            .field("fqdn", &self.fqdn)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Host as entered by the operator, before the store assigns an id.
#[derive(Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub management: Option<ManagementEndpoint>,
}

impl fmt::Debug for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSpec")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("management", &self.management)
            .finish()
    }
}

/// Source hypervisor or migration target host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub management: Option<ManagementEndpoint>,
}

impl Host {
    pub fn from_spec(id: String, spec: HostSpec) -> Self {
        Self {
            id,
            address: spec.address,
            username: spec.username,
            password: spec.password,
            management: spec.management,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Management endpoint with both FQDN and API key filled in.
    pub fn usable_management(&self) -> Option<&ManagementEndpoint> {
        self.management
            .as_ref()
            .filter(|m| !m.fqdn.is_empty() && !m.api_key.is_empty())
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("management", &self.management)
            .finish()
    }
}

fn redacted(secret: &Option<String>) -> &'static str {
    if secret.is_some() { "<redacted>" } else { "<none>" }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PowerState {
    #[serde(rename = "poweredOn")]
    PoweredOn,
    #[serde(rename = "poweredOff")]
    PoweredOff,
    #[serde(rename = "suspended")]
    Suspended,
    #[serde(rename = "not present", alias = "absent")]
    Absent,
    #[default]
    #[serde(other)]
    Unknown,
}

impl PowerState {
    /// Ordering used to list replication candidates: running VMs first.
    pub fn readiness_rank(&self) -> u8 {
        match self {
            PowerState::PoweredOn => 0,
            PowerState::Suspended => 1,
            PowerState::PoweredOff => 2,
            PowerState::Absent | PowerState::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
            PowerState::Absent => "not present",
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OsType {
    Windows,
    Linux,
    #[default]
    #[serde(other)]
    Unknown,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Windows => "Windows",
            OsType::Linux => "Linux",
            OsType::Unknown => "Unknown",
        }
    }
}

/// Per-VM operation tracked through the generic status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Clone,
    Preparation,
    Migration,
    AgentInstall,
    Ping,
    Shutdown,
    IpReassignment,
}

impl OperationKind {
    /// Operations the polling scheduler follows, in priority order.
    pub const POLLED: [OperationKind; 3] = [
        OperationKind::Clone,
        OperationKind::Preparation,
        OperationKind::Migration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Clone => "clone",
            OperationKind::Preparation => "preparation",
            OperationKind::Migration => "migration",
            OperationKind::AgentInstall => "agent install",
            OperationKind::Ping => "ping",
            OperationKind::Shutdown => "shutdown",
            OperationKind::IpReassignment => "IP reassignment",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    #[serde(alias = "failed", alias = "failure")]
    Error,
}

impl OperationStatus {
    /// Map a backend status word. Unrecognised words mean the task is still going.
    pub fn from_backend(word: &str) -> Self {
        match word.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => OperationStatus::Pending,
            "success" | "completed" | "done" => OperationStatus::Success,
            "error" | "failed" | "failure" => OperationStatus::Error,
            _ => OperationStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Error)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Success => "success",
            OperationStatus::Error => "error",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub status: OperationStatus,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub log: Option<String>,
}

impl OperationRecord {
    pub fn new(status: OperationStatus) -> Self {
        Self {
            status,
            task_id: None,
            progress: None,
            log: None,
        }
    }

    pub fn running(task_id: Option<String>) -> Self {
        Self {
            task_id,
            ..Self::new(OperationStatus::Running)
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LiveSyncStatus {
    #[default]
    Idle,
    Ready,
    Syncing,
    Error,
}

/// Credentials the operator types into the live-sync dialog.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct LiveSyncCredentials {
    pub target_ip: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for LiveSyncCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSyncCredentials")
            .field("target_ip", &self.target_ip)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSyncState {
    #[serde(default)]
    pub status: LiveSyncStatus,
    #[serde(default)]
    pub target_ip: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub logs: Option<String>,
}

impl LiveSyncState {
    pub fn credentials(&self) -> LiveSyncCredentials {
        LiveSyncCredentials {
            target_ip: self.target_ip.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Username and password, both non-empty.
    pub fn login(&self) -> Option<(&str, &str)> {
        let username = self.username.as_deref().filter(|u| !u.is_empty())?;
        let password = self.password.as_deref().filter(|p| !p.is_empty())?;
        Some((username, password))
    }
}

impl fmt::Debug for LiveSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSyncState")
            .field("status", &self.status)
            .field("target_ip", &self.target_ip)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("logs", &self.logs.as_ref().map(|l| l.len()))
            .finish()
    }
}

/// Per-drive check-disk summary lines, keyed by drive letter.
pub type DiskReport = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheckResult {
    pub source_file_count: Option<i64>,
    pub target_file_count: Option<i64>,
    pub source_disk_report: Option<DiskReport>,
    pub target_disk_report: Option<DiskReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub storage_usage: f64,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub guest_os: Option<String>,
    #[serde(default)]
    pub os_type: OsType,
    pub host_id: String,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub clone_name: Option<String>,
    #[serde(default)]
    pub operations: BTreeMap<OperationKind, OperationRecord>,
    #[serde(default)]
    pub live_sync: LiveSyncState,
    #[serde(default)]
    pub files: FileCheckResult,
    #[serde(default)]
    pub new_target_ip: Option<String>,
}

impl VirtualMachine {
    pub fn new(id: impl Into<String>, name: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            power_state: PowerState::Unknown,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            storage_usage: 0.0,
            ip_address: None,
            hostname: None,
            guest_os: None,
            os_type: OsType::Unknown,
            host_id: host_id.into(),
            target_name: None,
            clone_name: None,
            operations: BTreeMap::new(),
            live_sync: LiveSyncState::default(),
            files: FileCheckResult::default(),
            new_target_ip: None,
        }
    }

    pub fn operation(&self, kind: OperationKind) -> Option<&OperationRecord> {
        self.operations.get(&kind)
    }

    pub fn status(&self, kind: OperationKind) -> Option<OperationStatus> {
        self.operation(kind).map(|record| record.status)
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.status(kind) == Some(OperationStatus::Running)
    }

    pub fn set_operation(&mut self, kind: OperationKind, record: OperationRecord) {
        self.operations.insert(kind, record);
    }

    /// Existing record for `kind`, created as pending when absent.
    pub fn operation_mut(&mut self, kind: OperationKind) -> &mut OperationRecord {
        self.operations
            .entry(kind)
            .or_insert_with(|| OperationRecord::new(OperationStatus::Pending))
    }

    /// First polled operation currently running, in scheduler priority order.
    pub fn active_polled_operation(&self) -> Option<OperationKind> {
        OperationKind::POLLED
            .into_iter()
            .find(|kind| self.is_running(*kind))
    }

    pub fn usable_address(&self) -> Option<&str> {
        usable(self.ip_address.as_deref())
    }

    pub fn usable_hostname(&self) -> Option<&str> {
        usable(self.hostname.as_deref())
    }
}

fn usable(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != NOT_AVAILABLE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    #[serde(rename = "Pre-Check")]
    PreCheck,
    #[serde(rename = "Migration Preparation")]
    MigrationPreparation,
    #[serde(rename = "Replication")]
    Replication,
    #[serde(rename = "Ping Test")]
    PingTest,
    #[serde(rename = "Delta Sync")]
    DeltaSync,
    #[serde(rename = "Shutdown Source VMs")]
    ShutdownSourceVms,
    #[serde(rename = "Install Agent")]
    InstallAgent,
    #[serde(rename = "IP Re-Assignment")]
    IpReassignment,
}

impl StageName {
    pub const DEFAULTS: [StageName; 3] = [
        StageName::PreCheck,
        StageName::MigrationPreparation,
        StageName::Replication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::PreCheck => "Pre-Check",
            StageName::MigrationPreparation => "Migration Preparation",
            StageName::Replication => "Replication",
            StageName::PingTest => "Ping Test",
            StageName::DeltaSync => "Delta Sync",
            StageName::ShutdownSourceVms => "Shutdown Source VMs",
            StageName::InstallAgent => "Install Agent",
            StageName::IpReassignment => "IP Re-Assignment",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    pub status: StageStatus,
    #[serde(default)]
    pub content: Option<String>,
}

impl Stage {
    pub fn new(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            content: None,
        }
    }

    /// Enter `running`. Allowed from every state so a stage can be performed again.
    pub fn begin(&mut self) {
        self.status = StageStatus::Running;
    }

    /// Settle a running stage. Returns false when the stage was not running.
    pub fn finish(&mut self, outcome: StageStatus, content: Option<String>) -> bool {
        if self.status != StageStatus::Running
            || !matches!(outcome, StageStatus::Success | StageStatus::Failure)
        {
            return false;
        }
        self.status = outcome;
        if content.is_some() {
            self.content = content;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationWave {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub vms: Vec<VirtualMachine>,
    pub stages: Vec<Stage>,
}

impl MigrationWave {
    /// New wave with the three default stages. Duplicate VM ids keep their first copy.
    pub fn new(name: impl Into<String>, vms: Vec<VirtualMachine>) -> Self {
        let mut seen = HashSet::new();
        let vms = vms
            .into_iter()
            .filter(|vm| seen.insert(vm.id.clone()))
            .collect();

        Self {
            id: format!("wave-{}", Uuid::new_v4()),
            name: name.into(),
            created_at: Utc::now(),
            vms,
            stages: StageName::DEFAULTS.into_iter().map(Stage::new).collect(),
        }
    }

    pub fn vm(&self, vm_id: &str) -> Option<&VirtualMachine> {
        self.vms.iter().find(|vm| vm.id == vm_id)
    }

    pub fn vm_mut(&mut self, vm_id: &str) -> Option<&mut VirtualMachine> {
        self.vms.iter_mut().find(|vm| vm.id == vm_id)
    }

    pub fn stage(&self, name: StageName) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Stage by name, appended as pending if the wave does not carry it yet.
    pub fn stage_mut(&mut self, name: StageName) -> &mut Stage {
        let index = match self.stages.iter().position(|stage| stage.name == name) {
            Some(index) => index,
            None => {
                self.stages.push(Stage::new(name));
                self.stages.len() - 1
            }
        };
        &mut self.stages[index]
    }

    /// Wave-level status derived from every VM's record for `kind`.
    pub fn aggregate_status(&self, kind: OperationKind) -> StageStatus {
        let statuses: Vec<Option<OperationStatus>> =
            self.vms.iter().map(|vm| vm.status(kind)).collect();

        if statuses.is_empty() {
            return StageStatus::Pending;
        }
        if statuses.iter().all(|s| *s == Some(OperationStatus::Success)) {
            StageStatus::Success
        } else if statuses.iter().any(|s| *s == Some(OperationStatus::Error)) {
            StageStatus::Failure
        } else if statuses.iter().any(|s| *s == Some(OperationStatus::Running)) {
            StageStatus::Running
        } else {
            StageStatus::Pending
        }
    }

    /// VMs ordered for replication: powered-on first, unknown last.
    pub fn replication_candidates(&self) -> Vec<&VirtualMachine> {
        let mut vms: Vec<&VirtualMachine> = self.vms.iter().collect();
        vms.sort_by_key(|vm| vm.power_state.readiness_rank());
        vms
    }
}
