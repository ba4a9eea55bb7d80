//! Live replication between a source VM and its target, plus the log monitor
//! an operator keeps open while a sync runs.

use crate::backend::{ActionResult, LiveSyncAction, LiveSyncRequest, LogFlavor};
use crate::model::{LiveSyncCredentials, LiveSyncStatus, OsType, VirtualMachine};
use crate::orchestrator::Orchestrator;
use crate::{log_debug, log_info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

impl Orchestrator {
    /// Run `start`, `stop` or `logs` for a VM with the credentials the operator
    /// entered. The credentials are stored on the wave's VM copy first.
    ///
    /// Windows VMs start through the Windows sync endpoint and stop locally.
    pub async fn live_sync_action(
        &self,
        wave_id: &str,
        vm_id: &str,
        action: LiveSyncAction,
        credentials: LiveSyncCredentials,
    ) -> Option<ActionResult> {
        let vm = self.wave_vm(wave_id, vm_id)?;
        let request = self.live_sync_request(wave_id, &vm, credentials)?;

        if vm.os_type == OsType::Windows {
            return match action {
                LiveSyncAction::Start => self.start_windows_sync_request(wave_id, vm_id, &request).await,
                LiveSyncAction::Stop => {
                    self.set_live_sync_status(wave_id, vm_id, LiveSyncStatus::Ready);
                    Some(ActionResult {
                        status: Some("stopped".to_string()),
                        message: Some(format!("Live sync for {} marked as stopped.", vm.name)),
                        logs: None,
                    })
                }
                LiveSyncAction::Logs => {
                    let logs = self.get_live_sync_logs(wave_id, vm_id).await?;
                    Some(ActionResult {
                        logs: Some(logs),
                        ..ActionResult::default()
                    })
                }
            };
        }

        match self.backend.live_sync(action, &request).await {
            Ok(result) => {
                log_info!("Live sync {} accepted for {}", action.as_str(), vm.name);
                match action {
                    LiveSyncAction::Start => {
                        self.set_live_sync_status(wave_id, vm_id, LiveSyncStatus::Syncing)
                    }
                    LiveSyncAction::Stop => {
                        self.set_live_sync_status(wave_id, vm_id, LiveSyncStatus::Ready)
                    }
                    LiveSyncAction::Logs => {
                        if let Some(logs) = result.logs.clone() {
                            self.store
                                .update_vm(wave_id, vm_id, |vm| vm.live_sync.logs = Some(logs));
                        }
                    }
                }
                Some(result)
            }
            Err(e) => {
                self.notices.error("Live Sync Error", e.detail());
                if action == LiveSyncAction::Start {
                    self.set_live_sync_status(wave_id, vm_id, LiveSyncStatus::Error);
                }
                None
            }
        }
    }

    /// Start the Windows (robocopy based) sync for a VM.
    pub async fn start_windows_live_sync(
        &self,
        wave_id: &str,
        vm_id: &str,
        credentials: LiveSyncCredentials,
    ) -> Option<ActionResult> {
        let vm = self.wave_vm(wave_id, vm_id)?;
        let request = self.live_sync_request(wave_id, &vm, credentials)?;
        self.start_windows_sync_request(wave_id, vm_id, &request).await
    }

    /// Fetch the current sync log for a VM and store it on the wave copy.
    pub async fn get_live_sync_logs(&self, wave_id: &str, vm_id: &str) -> Option<String> {
        let vm = self.wave_vm(wave_id, vm_id)?;
        let source = vm.usable_address()?.to_string();
        let target = vm.live_sync.target_ip.clone().filter(|ip| !ip.is_empty())?;

        match self
            .backend
            .live_sync_logs(&source, &target, LogFlavor::for_os(vm.os_type))
            .await
        {
            Ok(logs) => {
                let stored = logs.clone();
                self.store
                    .update_vm(wave_id, vm_id, |vm| vm.live_sync.logs = Some(stored));
                Some(logs)
            }
            Err(e) => {
                self.notices.error("Error Fetching Logs", e.detail());
                None
            }
        }
    }

    /// Poll the sync log every `live_sync.log_interval_seconds` while the VM is
    /// syncing, until the monitor is closed or dropped.
    pub fn open_live_sync_monitor(&self, wave_id: &str, vm_id: &str) -> LiveSyncMonitor {
        let token = self.background.child_token();
        let orchestrator = self.clone();
        let wave_id = wave_id.to_string();
        let vm_id = vm_id.to_string();
        let period = self.config.log_interval();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(vm) = orchestrator.wave_vm(&wave_id, &vm_id) else {
                    log_debug!("VM {} left wave {}, closing log monitor", vm_id, wave_id);
                    break;
                };
                if vm.live_sync.status == LiveSyncStatus::Syncing {
                    tokio::select! {
                        _ = cancelled.cancelled() => break,
                        _ = orchestrator.get_live_sync_logs(&wave_id, &vm_id) => {}
                    }
                }
            }
        });

        LiveSyncMonitor {
            token,
            handle: Some(handle),
        }
    }

    fn live_sync_request(
        &self,
        wave_id: &str,
        vm: &VirtualMachine,
        credentials: LiveSyncCredentials,
    ) -> Option<LiveSyncRequest> {
        let filled = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
        let request = match (
            vm.usable_address(),
            filled(&credentials.target_ip),
            filled(&credentials.username),
            filled(&credentials.password),
        ) {
            (Some(source_ip), Some(target_ip), Some(username), Some(password)) => LiveSyncRequest {
                source_ip: source_ip.to_string(),
                target_ip,
                username,
                password,
            },
            _ => {
                self.notices
                    .error("Error", "Source/Target details are incomplete.");
                return None;
            }
        };

        self.store.update_vm(wave_id, &vm.id, |vm| {
            vm.live_sync.target_ip = credentials.target_ip;
            vm.live_sync.username = credentials.username;
            vm.live_sync.password = credentials.password;
        });
        Some(request)
    }

    async fn start_windows_sync_request(
        &self,
        wave_id: &str,
        vm_id: &str,
        request: &LiveSyncRequest,
    ) -> Option<ActionResult> {
        match self.backend.start_windows_sync(request).await {
            Ok(result) => {
                self.set_live_sync_status(wave_id, vm_id, LiveSyncStatus::Syncing);
                Some(result)
            }
            Err(e) => {
                self.notices.error("Windows Sync Error", e.detail());
                self.set_live_sync_status(wave_id, vm_id, LiveSyncStatus::Error);
                None
            }
        }
    }

    fn set_live_sync_status(&self, wave_id: &str, vm_id: &str, status: LiveSyncStatus) {
        self.store
            .update_vm(wave_id, vm_id, |vm| vm.live_sync.status = status);
    }
}

/// Handle to a running log monitor. Closing or dropping it stops the polling.
pub struct LiveSyncMonitor {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LiveSyncMonitor {
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop polling and wait for the monitor task to exit.
    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LiveSyncMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
