use crate::backend::{AgentInstallRequest, IpReassignRequest};
use crate::config::AgentStagePolicy;
use crate::model::{
    OperationKind, OperationRecord, OperationStatus, OsType, StageName, StageStatus,
};
use crate::orchestrator::Orchestrator;
use crate::{Result, WaveError, log_info};

/// Strict dotted-quad IPv4 check: four parts of one to three digits, each at
/// most 255. Leading zeros are accepted.
pub fn is_valid_ipv4(address: &str) -> bool {
    let parts: Vec<&str> = address.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|part| {
            !part.is_empty()
                && part.len() <= 3
                && part.bytes().all(|b| b.is_ascii_digit())
                && part.parse::<u16>().is_ok_and(|value| value <= 255)
        })
}

impl Orchestrator {
    /// Install the management agent on every VM of a wave, one VM at a time.
    ///
    /// The `Install Agent` stage is settled according to
    /// `stages.agent_policy` once every VM has been attempted.
    pub async fn install_agent(&self, wave_id: &str) {
        let Some(wave) = self.wave(wave_id) else {
            return;
        };
        self.store.begin_stage(wave_id, StageName::InstallAgent);

        for vm in &wave.vms {
            let target = vm
                .target_name
                .as_deref()
                .and_then(|address| {
                    self.store
                        .snapshot()
                        .target_host_by_address(address)
                        .cloned()
                });
            let management = target.as_ref().and_then(|host| host.usable_management());

            let (Some(management), Some((username, password))) = (management, vm.live_sync.login())
            else {
                self.notices.warn(
                    "Agent Install Skipped",
                    format!(
                        "Skipping agent install for {}: Missing management or VM credentials.",
                        vm.name
                    ),
                );
                self.record_error(
                    wave_id,
                    &vm.id,
                    OperationKind::AgentInstall,
                    "Missing management or VM credentials.",
                );
                continue;
            };

            let request = AgentInstallRequest {
                api_key: management.api_key.clone(),
                vme_host: management.fqdn.clone(),
                vm_name: vm.name.clone(),
                vm_username: username.to_string(),
                vm_password: password.to_string(),
            };

            self.record(
                wave_id,
                &vm.id,
                OperationKind::AgentInstall,
                OperationRecord::running(None),
            );

            match self.backend.install_agent(&request).await {
                Ok(()) => {
                    self.record(
                        wave_id,
                        &vm.id,
                        OperationKind::AgentInstall,
                        OperationRecord::new(OperationStatus::Success),
                    );
                    self.notices.info(
                        "Success",
                        format!("Agent installation started for {}.", vm.name),
                    );
                }
                Err(e) => {
                    let detail = e.detail();
                    self.notices.error(
                        &format!("Agent Install Error for {}", vm.name),
                        detail.clone(),
                    );
                    self.record_error(wave_id, &vm.id, OperationKind::AgentInstall, detail);
                }
            }
        }

        let Some(wave) = self.wave(wave_id) else {
            return;
        };
        let installed = wave
            .vms
            .iter()
            .filter(|vm| vm.status(OperationKind::AgentInstall) == Some(OperationStatus::Success))
            .count();
        let outcome = match self.config.stages.agent_policy {
            AgentStagePolicy::AlwaysSuccess => StageStatus::Success,
            AgentStagePolicy::Aggregate => match wave.aggregate_status(OperationKind::AgentInstall) {
                StageStatus::Success => StageStatus::Success,
                _ if wave.vms.is_empty() => StageStatus::Success,
                _ => StageStatus::Failure,
            },
        };
        self.store.finish_stage(
            wave_id,
            StageName::InstallAgent,
            outcome,
            Some(format!("Agent installed on {} of {} VMs.", installed, wave.vms.len())),
        );
    }

    /// Move a migrated VM to `new_ip`.
    ///
    /// The address is validated before anything is touched: an invalid address
    /// is rejected with the VM left as it was. Returns the recorded outcome.
    pub async fn reassign_vm_ip(
        &self,
        wave_id: &str,
        vm_id: &str,
        new_ip: &str,
    ) -> Result<OperationStatus> {
        let new_ip = new_ip.trim();
        if !is_valid_ipv4(new_ip) {
            self.notices.error(
                "Invalid IP Address",
                format!("'{}' is not a valid IPv4 address.", new_ip),
            );
            return Err(WaveError::Validation(format!("invalid IPv4 address '{}'", new_ip)));
        }

        let Some(vm) = self.wave_vm(wave_id, vm_id) else {
            self.notices.error("Error", "VM not found in wave.");
            return Err(WaveError::VmNotFound(vm_id.to_string()));
        };

        let current_ip = vm.live_sync.target_ip.clone().filter(|ip| !ip.is_empty());
        let (Some(current_ip), Some((username, password))) = (current_ip, vm.live_sync.login()) else {
            self.notices.error(
                "IP Reassignment Failed",
                format!("VM credentials for {} not found.", vm.name),
            );
            self.record_error(
                wave_id,
                vm_id,
                OperationKind::IpReassignment,
                "VM credentials not found.",
            );
            return Ok(OperationStatus::Error);
        };

        if !matches!(vm.os_type, OsType::Windows | OsType::Linux) {
            self.notices.error(
                "Not Supported",
                "IP reassignment is only supported for Windows and Linux VMs.",
            );
            self.record_error(
                wave_id,
                vm_id,
                OperationKind::IpReassignment,
                "Unsupported operating system.",
            );
            return Ok(OperationStatus::Error);
        }

        let request = IpReassignRequest {
            source_ip: current_ip,
            target_ip: new_ip.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            os_type: vm.os_type.as_str().to_string(),
        };

        let requested = new_ip.to_string();
        self.store.update_vm(wave_id, vm_id, |vm| {
            vm.new_target_ip = Some(requested);
            vm.set_operation(
                OperationKind::IpReassignment,
                OperationRecord::running(None).with_log("Connecting to VM via SSH..."),
            );
        });
        log_info!("Reassigning {} from {} to {}", vm.name, request.source_ip, new_ip);

        match self.backend.reassign_ip(&request).await {
            Ok(response) => {
                if let Some(message) = &response.message {
                    self.notices.info("IP Reassignment Success", message.clone());
                }
                let log = response
                    .logs
                    .unwrap_or_else(|| "IP reassignment completed successfully".to_string());
                let assigned = new_ip.to_string();
                self.store.update_vm(wave_id, vm_id, |vm| {
                    vm.live_sync.target_ip = Some(assigned);
                    vm.set_operation(
                        OperationKind::IpReassignment,
                        OperationRecord::new(OperationStatus::Success).with_log(log),
                    );
                });
                Ok(OperationStatus::Success)
            }
            Err(e) => {
                let detail = e.detail();
                self.notices.error("IP Reassignment Error", detail.clone());
                self.record_error(wave_id, vm_id, OperationKind::IpReassignment, detail);
                Ok(OperationStatus::Error)
            }
        }
    }

    /// Progress lines the service collected for a reassignment started from `source_ip`.
    pub async fn ip_reassignment_logs(&self, source_ip: &str) -> Result<Vec<String>> {
        self.backend
            .ip_reassignment_logs(source_ip)
            .await
            .map_err(|e| {
                self.notices.error("Error Fetching Logs", e.detail());
                WaveError::from(e)
            })
    }
}
