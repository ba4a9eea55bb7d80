// In-process migration service used by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wavepilot::backend::{
    ActionResult, AgentInstallRequest, BackendError, BackendResult, CloneResponse, FileCheckHost,
    IpReassignRequest, IpReassignResponse, LiveSyncAction, LiveSyncRequest, LogFlavor,
    MigrationBackend, OperationReport, ShutdownResponse, TaskProgress, VmStatusReport,
};
use wavepilot::model::{DiskReport, Host, HostSpec, PowerState, VirtualMachine};
use wavepilot::{Orchestrator, PilotConfig};

/// Canned answers. Anything not set answers with a plausible success.
#[derive(Default)]
pub struct Script {
    pub vms: Vec<VirtualMachine>,
    pub already_cloned: HashSet<String>,
    pub clone_failures: HashSet<String>,
    /// Task id to sequence of states; the last one repeats.
    pub task_states: HashMap<String, Vec<&'static str>>,
    /// How long a progress query for a task takes to answer.
    pub task_delays: HashMap<String, Duration>,
    pub preparation_status: Option<&'static str>,
    pub prepare_failures: HashSet<String>,
    pub create_fails: bool,
    pub vm_status: Vec<VmStatusReport>,
    pub ping: Option<HashMap<String, String>>,
    pub ping_fails: bool,
    pub file_counts: HashMap<String, i64>,
    pub disk_reports: HashMap<String, DiskReport>,
    pub shutdown_status: Option<&'static str>,
    pub agent_failures: HashSet<String>,
    pub live_sync_fails: bool,
    pub reassign_fails: bool,
    pub logs: String,
}

#[derive(Default)]
pub struct FakeBackend {
    pub script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    task_polls: Mutex<HashMap<String, usize>>,
}

impl FakeBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn failure(detail: &str) -> BackendError {
        BackendError::Status {
            status: 500,
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
impl MigrationBackend for FakeBackend {
    async fn list_vms(&self, host: &Host) -> BackendResult<Vec<VirtualMachine>> {
        self.record(format!("list_vms {}", host.address));
        Ok(self.script.lock().unwrap().vms.clone())
    }

    async fn precheck_report(&self, _host: &Host, vm_names: &[String]) -> BackendResult<Vec<u8>> {
        self.record(format!("precheck {}", vm_names.join(",")));
        Ok(b"%PDF-1.4 report".to_vec())
    }

    async fn start_clone(&self, _host: &Host, vm_name: &str) -> BackendResult<CloneResponse> {
        self.record(format!("clone {}", vm_name));
        let script = self.script.lock().unwrap();
        if script.clone_failures.contains(vm_name) {
            return Err(Self::failure(&format!("Failed to start cloning for {}.", vm_name)));
        }
        if script.already_cloned.contains(vm_name) {
            return Ok(CloneResponse {
                status: Some("already_exists".into()),
                clone_name: Some(format!("{}-clone", vm_name)),
                ..CloneResponse::default()
            });
        }
        Ok(CloneResponse {
            task_id: Some(format!("task-{}", vm_name)),
            clone_name: Some(format!("{}-clone", vm_name)),
            ..CloneResponse::default()
        })
    }

    async fn task_progress(&self, _host: &Host, task_id: &str) -> BackendResult<TaskProgress> {
        self.record(format!("task {}", task_id));
        let (states, delay) = {
            let script = self.script.lock().unwrap();
            (
                script
                    .task_states
                    .get(task_id)
                    .cloned()
                    .unwrap_or_else(|| vec!["success"]),
                script.task_delays.get(task_id).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = {
            let mut polls = self.task_polls.lock().unwrap();
            let seen = polls.entry(task_id.to_string()).or_insert(0);
            let state = states[(*seen).min(states.len() - 1)];
            *seen += 1;
            state
        };
        match state {
            "gone" => Err(BackendError::NotFound("Task not found.".into())),
            "offline" => Err(BackendError::Transport("connection refused".into())),
            "broken" => Err(Self::failure("task failed")),
            other => Ok(TaskProgress {
                progress: if other == "success" { 100.0 } else { 40.0 },
                state: other.to_string(),
            }),
        }
    }

    async fn prepare_for_target(&self, _host: &Host, clone_name: &str) -> BackendResult<()> {
        self.record(format!("prepare {}", clone_name));
        if self.script.lock().unwrap().prepare_failures.contains(clone_name) {
            return Err(Self::failure("Preparation could not start"));
        }
        Ok(())
    }

    async fn preparation_status(&self, clone_name: &str) -> BackendResult<OperationReport> {
        self.record(format!("preparation_status {}", clone_name));
        let status = self
            .script
            .lock()
            .unwrap()
            .preparation_status
            .unwrap_or("success");
        Ok(OperationReport {
            status: status.to_string(),
            logs: Some(format!("{} preparation {}", clone_name, status)),
            progress: None,
        })
    }

    async fn create_target_vm(
        &self,
        _source: &Host,
        target: &Host,
        clone_name: &str,
    ) -> BackendResult<()> {
        self.record(format!("create_target {} {}", clone_name, target.address));
        if self.script.lock().unwrap().create_fails {
            return Err(Self::failure("Target host rejected the VM"));
        }
        Ok(())
    }

    async fn migration_status(&self, clone_name: &str) -> BackendResult<OperationReport> {
        self.record(format!("migration_status {}", clone_name));
        Ok(OperationReport {
            status: "running".into(),
            logs: Some("copying disks".into()),
            progress: Some(50.0),
        })
    }

    async fn check_vms(
        &self,
        _host: &Host,
        vm_names: &[String],
    ) -> BackendResult<Vec<VmStatusReport>> {
        self.record(format!("check_vms {}", vm_names.join(",")));
        Ok(self.script.lock().unwrap().vm_status.clone())
    }

    async fn live_sync(
        &self,
        action: LiveSyncAction,
        request: &LiveSyncRequest,
    ) -> BackendResult<ActionResult> {
        self.record(format!(
            "live_sync {} {} {}",
            action.as_str(),
            request.source_ip,
            request.target_ip
        ));
        if self.script.lock().unwrap().live_sync_fails {
            return Err(Self::failure("Live sync action failed"));
        }
        Ok(ActionResult {
            status: Some("started".into()),
            ..ActionResult::default()
        })
    }

    async fn start_windows_sync(&self, request: &LiveSyncRequest) -> BackendResult<ActionResult> {
        self.record(format!("windows_sync {} {}", request.source_ip, request.target_ip));
        if self.script.lock().unwrap().live_sync_fails {
            return Err(Self::failure("Windows live sync action failed"));
        }
        Ok(ActionResult::default())
    }

    async fn live_sync_logs(
        &self,
        source_ip: &str,
        target_ip: &str,
        flavor: LogFlavor,
    ) -> BackendResult<String> {
        self.record(format!("logs {} {} {}", source_ip, target_ip, flavor.as_str()));
        Ok(self.script.lock().unwrap().logs.clone())
    }

    async fn install_agent(&self, request: &AgentInstallRequest) -> BackendResult<()> {
        self.record(format!("install_agent {} {}", request.vm_name, request.vme_host));
        if self.script.lock().unwrap().agent_failures.contains(&request.vm_name) {
            return Err(Self::failure("Agent installation failed"));
        }
        Ok(())
    }

    async fn ping(&self, hostnames: &[String]) -> BackendResult<HashMap<String, String>> {
        self.record(format!("ping {}", hostnames.join(",")));
        let script = self.script.lock().unwrap();
        if script.ping_fails {
            return Err(BackendError::Transport("connection reset".into()));
        }
        Ok(script.ping.clone().unwrap_or_else(|| {
            hostnames
                .iter()
                .map(|h| (h.clone(), "success".to_string()))
                .collect()
        }))
    }

    async fn check_files(&self, hosts: &[FileCheckHost]) -> BackendResult<HashMap<String, i64>> {
        let addresses: Vec<&str> = hosts.iter().map(|h| h.ip_address.as_str()).collect();
        self.record(format!("check_files {}", addresses.join(",")));
        Ok(self.script.lock().unwrap().file_counts.clone())
    }

    async fn check_files_windows(
        &self,
        hosts: &[FileCheckHost],
    ) -> BackendResult<HashMap<String, DiskReport>> {
        let addresses: Vec<&str> = hosts.iter().map(|h| h.ip_address.as_str()).collect();
        self.record(format!("check_files_windows {}", addresses.join(",")));
        Ok(self.script.lock().unwrap().disk_reports.clone())
    }

    async fn shutdown_vm(&self, _host: &Host, vm_name: &str) -> BackendResult<ShutdownResponse> {
        self.record(format!("shutdown {}", vm_name));
        let status = self
            .script
            .lock()
            .unwrap()
            .shutdown_status
            .unwrap_or("shutdown_initiated");
        Ok(ShutdownResponse {
            status: Some(status.to_string()),
            message: Some(format!("Graceful shutdown initiated for '{}'.", vm_name)),
        })
    }

    async fn reassign_ip(&self, request: &IpReassignRequest) -> BackendResult<IpReassignResponse> {
        self.record(format!(
            "reassign_ip {} {} {}",
            request.source_ip, request.target_ip, request.os_type
        ));
        if self.script.lock().unwrap().reassign_fails {
            return Err(Self::failure("SSH authentication failed."));
        }
        Ok(IpReassignResponse {
            message: Some("IP reassignment process initiated".into()),
            logs: None,
        })
    }

    async fn ip_reassignment_logs(&self, source_ip: &str) -> BackendResult<Vec<String>> {
        self.record(format!("reassign_logs {}", source_ip));
        Ok(vec!["[INFO] Connected".into(), "[SUCCESS] Sent IP change command".into()])
    }
}

pub const SOURCE: &str = "10.0.0.5";
pub const TARGET: &str = "172.16.0.20";

pub fn test_config() -> PilotConfig {
    let mut config = PilotConfig::default();
    config.polling.interval_seconds = 1;
    config.polling.max_consecutive_failures = 3;
    config.polling.operation_timeout_seconds = 60;
    config.pipeline.step_timeout_seconds = 30;
    config.shutdown.watch_interval_seconds = 1;
    config.shutdown.watch_timeout_seconds = 10;
    config
}

pub fn vm(id: &str, name: &str, power: PowerState) -> VirtualMachine {
    let mut vm = VirtualMachine::new(id, name, "unassigned");
    vm.power_state = power;
    vm.hostname = Some(format!("{}.lab", name));
    vm.ip_address = Some(format!("10.0.1.{}", id.trim_start_matches('v')));
    vm
}

pub fn host(address: &str) -> HostSpec {
    HostSpec {
        address: address.to_string(),
        username: "root".to_string(),
        password: Some("secret".to_string()),
        management: None,
    }
}

/// Orchestrator with one source host, one target host and a wave built from
/// `vms`, all mapped to the target. Returns the wave id.
pub fn wave_with(
    backend: Arc<FakeBackend>,
    config: PilotConfig,
    vms: Vec<VirtualMachine>,
) -> (Orchestrator, String) {
    let orchestrator = Orchestrator::new(backend, config);
    let store = orchestrator.store();
    orchestrator.add_host(host(SOURCE));
    let mut target = host(TARGET);
    target.management = Some(wavepilot::model::ManagementEndpoint {
        fqdn: "vme.lab".into(),
        api_key: "api-key".into(),
    });
    orchestrator.add_target_host(target);

    let snapshot = store.snapshot();
    let host_id = snapshot.hosts[0].id.clone();
    let target_id = snapshot.target_hosts[0].id.clone();

    let vms: Vec<VirtualMachine> = vms
        .into_iter()
        .map(|mut vm| {
            vm.host_id = host_id.clone();
            vm
        })
        .collect();
    let ids: Vec<String> = vms.iter().map(|vm| vm.id.clone()).collect();
    store.replace_discovered_vms(vms.clone());
    let wave_id = store.create_wave("Phase1", vms);
    store.map_target_to_vms(&wave_id, &ids, &target_id).unwrap();
    (orchestrator, wave_id)
}
