use crate::model::{StageName, StageStatus, VirtualMachine};
use crate::orchestrator::Orchestrator;
use crate::log_debug;

impl Orchestrator {
    /// Refresh power state, guest OS and OS class of every VM in a wave.
    ///
    /// Uses the first VM's host for the whole wave. Returns false when the
    /// check could not run or the request failed.
    pub async fn check_vm_status_for_wave(&self, wave_id: &str) -> bool {
        let Some(wave) = self.wave(wave_id) else {
            return false;
        };
        let Some(first) = wave.vms.first() else {
            self.notices.error("Error", "No VMs in wave to check.");
            return false;
        };
        let Some(host) = self.source_host(first) else {
            self.notices.error("Error", "Host credentials not found.");
            return false;
        };

        let names: Vec<String> = wave.vms.iter().map(|vm| vm.name.clone()).collect();
        let reports = match self.backend.check_vms(&host, &names).await {
            Ok(reports) => reports,
            Err(e) => {
                self.notices.error("Error", e.detail());
                return false;
            }
        };

        for report in reports {
            let Some(vm) = wave.vms.iter().find(|vm| vm.name == report.name) else {
                log_debug!("Status report for unknown VM {}", report.name);
                continue;
            };
            self.store.update_vm(wave_id, &vm.id, |vm| {
                vm.power_state = report.power_state;
                vm.guest_os = report.guest_os;
                vm.os_type = report.os_type;
            });
        }
        true
    }

    /// Status check wrapped in the wave's `Replication` stage.
    pub async fn run_replication_check(&self, wave_id: &str) -> bool {
        if !self.store.begin_stage(wave_id, StageName::Replication) {
            return false;
        }
        let checked = self.check_vm_status_for_wave(wave_id).await;
        let (outcome, content) = if checked {
            (StageStatus::Success, "VM status refreshed.")
        } else {
            (StageStatus::Failure, "VM status check failed.")
        };
        self.store.finish_stage(
            wave_id,
            StageName::Replication,
            outcome,
            Some(content.to_string()),
        );
        checked
    }

    /// Wave VMs ordered for replication: powered-on first, unknown or absent last.
    pub fn replication_candidates(&self, wave_id: &str) -> Vec<VirtualMachine> {
        self.wave(wave_id)
            .map(|wave| {
                wave.replication_candidates()
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
