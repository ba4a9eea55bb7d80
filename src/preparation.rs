use crate::model::{OperationKind, OperationRecord};
use crate::orchestrator::Orchestrator;
use crate::log_info;

impl Orchestrator {
    /// Ask the service to prepare a VM's clone for the target platform.
    pub async fn prepare_clone_for_target(&self, wave_id: &str, vm_id: &str) {
        let Some(vm) = self.wave_vm(wave_id, vm_id) else {
            return;
        };

        let Some(clone_name) = vm.clone_name.clone() else {
            self.notices.error(
                "Preparation Failed",
                format!("{} has no clone to prepare. Clone it first.", vm.name),
            );
            self.record_error(
                wave_id,
                vm_id,
                OperationKind::Preparation,
                "No clone name recorded for this VM.",
            );
            return;
        };

        let Some(host) = self.source_host(&vm) else {
            self.notices.error(
                "Preparation Failed",
                format!("Credentials not found for host of VM {}.", vm.name),
            );
            self.record_error(
                wave_id,
                vm_id,
                OperationKind::Preparation,
                "Source host credentials not found.",
            );
            return;
        };

        self.record(
            wave_id,
            vm_id,
            OperationKind::Preparation,
            OperationRecord::running(None).with_log("Starting preparation..."),
        );
        log_info!("Preparing clone {} for target", clone_name);

        if let Err(e) = self.backend.prepare_for_target(&host, &clone_name).await {
            let detail = e.detail();
            self.notices.error("Preparation Error", detail.clone());
            self.record_error(wave_id, vm_id, OperationKind::Preparation, detail);
        }
    }

    /// Create the VM on its mapped target host from the prepared clone.
    pub async fn create_target_vm(&self, wave_id: &str, vm_id: &str) {
        let Some(vm) = self.wave_vm(wave_id, vm_id) else {
            return;
        };

        let missing = if vm.clone_name.is_none() {
            Some("No clone name recorded for this VM.")
        } else if vm.target_name.is_none() {
            Some("No target host mapped to this VM.")
        } else {
            None
        };
        if let Some(reason) = missing {
            self.notices
                .error("Migration Failed", format!("{}: {}", vm.name, reason));
            self.record_error(wave_id, vm_id, OperationKind::Migration, reason);
            return;
        }

        let (Some(source), Some(target)) = (self.source_host(&vm), self.target_host(&vm)) else {
            let reason = "Source or target host credentials not found.";
            self.notices
                .error("Migration Failed", format!("{}: {}", vm.name, reason));
            self.record_error(wave_id, vm_id, OperationKind::Migration, reason);
            return;
        };
        let clone_name = vm.clone_name.unwrap_or_default();

        self.record(
            wave_id,
            vm_id,
            OperationKind::Migration,
            OperationRecord::running(None).with_log("Initiating migration..."),
        );
        log_info!("Creating {} on target {}", clone_name, target.address);

        if let Err(e) = self
            .backend
            .create_target_vm(&source, &target, &clone_name)
            .await
        {
            let detail = e.detail();
            self.notices.error("Migration Error", detail.clone());
            self.record_error(wave_id, vm_id, OperationKind::Migration, detail);
        }
    }
}
