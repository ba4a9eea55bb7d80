use crate::model::{OperationKind, OperationRecord, OperationStatus, PowerState};
use crate::orchestrator::Orchestrator;
use crate::{log_debug, log_info};

/// Task id recorded when a VM is not running and its disks are used as-is.
pub const NOT_POWERED_ON_TASK: &str = "not-powered-on";
/// Task id recorded when the service reports the clone already exists.
pub const EXISTING_CLONE_TASK: &str = "existing-clone";

impl Orchestrator {
    /// Start cloning for each listed VM of a wave.
    ///
    /// VMs are handled independently: a missing host or a failed request only
    /// affects that VM.
    pub async fn initiate_cloning(&self, wave_id: &str, vm_ids: &[String]) {
        for vm_id in vm_ids {
            let Some(vm) = self.wave_vm(wave_id, vm_id) else {
                continue;
            };

            let Some(host) = self.source_host(&vm) else {
                self.notices.error(
                    "Cloning Failed",
                    format!("Credentials not found for host of VM {}.", vm.name),
                );
                continue;
            };

            if vm.power_state != PowerState::PoweredOn {
                log_debug!("{} is {}, using it without a clone", vm.name, vm.power_state);
                let name = vm.name.clone();
                self.store.update_vm(wave_id, vm_id, |vm| {
                    vm.clone_name = Some(name);
                    vm.set_operation(
                        OperationKind::Clone,
                        OperationRecord::new(OperationStatus::Success)
                            .with_task_id(NOT_POWERED_ON_TASK),
                    );
                });
                continue;
            }

            match self.backend.start_clone(&host, &vm.name).await {
                Ok(response) if response.already_exists() => {
                    log_info!("Clone of {} already exists", vm.name);
                    self.store.update_vm(wave_id, vm_id, |vm| {
                        if response.clone_name.is_some() {
                            vm.clone_name = response.clone_name;
                        }
                        vm.set_operation(
                            OperationKind::Clone,
                            OperationRecord::new(OperationStatus::Success)
                                .with_task_id(EXISTING_CLONE_TASK)
                                .with_progress(100),
                        );
                    });
                }
                Ok(response) => match response.task_id {
                    Some(task_id) => {
                        log_info!("Cloning {} as task {}", vm.name, task_id);
                        self.store.update_vm(wave_id, vm_id, |vm| {
                            vm.clone_name = response.clone_name;
                            vm.set_operation(
                                OperationKind::Clone,
                                OperationRecord::running(Some(task_id)).with_progress(0),
                            );
                        });
                    }
                    None => {
                        let message = format!("Clone request for {} returned no task.", vm.name);
                        self.notices.error("Cloning Error", message.clone());
                        self.store.update_vm(wave_id, vm_id, |vm| {
                            vm.set_operation(
                                OperationKind::Clone,
                                OperationRecord::new(OperationStatus::Error)
                                    .with_progress(0)
                                    .with_log(message),
                            );
                        });
                    }
                },
                Err(e) => {
                    let detail = e.detail();
                    self.notices.error("Cloning Error", detail.clone());
                    self.store.update_vm(wave_id, vm_id, |vm| {
                        vm.set_operation(
                            OperationKind::Clone,
                            OperationRecord::new(OperationStatus::Error)
                                .with_progress(0)
                                .with_log(detail),
                        );
                    });
                }
            }
        }
    }
}
