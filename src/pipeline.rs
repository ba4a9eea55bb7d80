use crate::model::{OperationKind, OperationStatus, StageName, StageStatus};
use crate::orchestrator::Orchestrator;
use crate::{Result, WaveError, log_info, log_warn};
use tokio::time::Instant;

/// How a single pipeline step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    NotStarted,
    /// The VM or its wave disappeared while waiting.
    Gone,
}

/// Per-VM result of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// VMs whose target creation was requested or had already succeeded.
    pub completed: Vec<String>,
    /// VM id and the reason its remaining steps were skipped.
    pub aborted: Vec<(String, String)>,
}

impl PipelineReport {
    pub fn all_completed(&self) -> bool {
        self.aborted.is_empty()
    }
}

impl Orchestrator {
    /// Drive every VM of a wave through clone, preparation and target
    /// creation, one VM at a time.
    ///
    /// Each wait is bounded by `pipeline.step_timeout_seconds`; a VM whose step
    /// fails or times out is abandoned while the rest of the wave continues.
    /// The progress poller must be running for clone and preparation to settle.
    pub async fn prepare_and_migrate_wave(&self, wave_id: &str) -> Result<PipelineReport> {
        let Some(wave) = self.wave(wave_id) else {
            self.notices.error("Error", "Wave not found.");
            return Err(WaveError::WaveNotFound(wave_id.to_string()));
        };

        self.store
            .begin_stage(wave_id, StageName::MigrationPreparation);
        log_info!("Starting migration pipeline for wave \"{}\" ({} VMs)", wave.name, wave.vms.len());

        let mut report = PipelineReport::default();
        for vm in &wave.vms {
            match self.migrate_one(wave_id, &vm.id).await {
                Ok(()) => report.completed.push(vm.id.clone()),
                Err(reason) => {
                    log_warn!("Pipeline stopped for {}: {}", vm.name, reason);
                    report.aborted.push((vm.id.clone(), reason));
                }
            }
        }

        let total = report.completed.len() + report.aborted.len();
        let outcome = if report.all_completed() {
            StageStatus::Success
        } else {
            StageStatus::Failure
        };
        self.store.finish_stage(
            wave_id,
            StageName::MigrationPreparation,
            outcome,
            Some(format!(
                "{} of {} VMs reached target creation.",
                report.completed.len(),
                total
            )),
        );
        Ok(report)
    }

    async fn migrate_one(&self, wave_id: &str, vm_id: &str) -> std::result::Result<(), String> {
        let vm = self
            .wave_vm(wave_id, vm_id)
            .ok_or_else(|| "removed from wave".to_string())?;

        if vm.status(OperationKind::Clone) != Some(OperationStatus::Success) {
            self.initiate_cloning(wave_id, &[vm_id.to_string()]).await;
            self.settle_step(wave_id, vm_id, OperationKind::Clone).await?;
        }

        let vm = self
            .wave_vm(wave_id, vm_id)
            .ok_or_else(|| "removed from wave".to_string())?;
        if vm.status(OperationKind::Preparation) != Some(OperationStatus::Success) {
            self.prepare_clone_for_target(wave_id, vm_id).await;
            self.settle_step(wave_id, vm_id, OperationKind::Preparation)
                .await?;
        }

        let vm = self
            .wave_vm(wave_id, vm_id)
            .ok_or_else(|| "removed from wave".to_string())?;
        if vm.status(OperationKind::Migration) != Some(OperationStatus::Success) {
            self.create_target_vm(wave_id, vm_id).await;
            let vm = self
                .wave_vm(wave_id, vm_id)
                .ok_or_else(|| "removed from wave".to_string())?;
            if vm.status(OperationKind::Migration) == Some(OperationStatus::Error) {
                let log = vm
                    .operation(OperationKind::Migration)
                    .and_then(|record| record.log.clone())
                    .unwrap_or_default();
                return Err(format!("target creation failed: {}", log));
            }
        }
        Ok(())
    }

    /// Wait for `kind` and translate the outcome. Timeouts are recorded as `error`.
    async fn settle_step(
        &self,
        wave_id: &str,
        vm_id: &str,
        kind: OperationKind,
    ) -> std::result::Result<(), String> {
        match self.wait_for_operation(wave_id, vm_id, kind).await {
            StepOutcome::Succeeded => Ok(()),
            StepOutcome::Failed(log) => Err(format!("{} failed: {}", kind, log)),
            StepOutcome::NotStarted => Err(format!("{} did not start", kind)),
            StepOutcome::Gone => Err("removed from wave".to_string()),
            StepOutcome::TimedOut => {
                let message = format!("timed out waiting for {}", kind);
                self.store.update_vm(wave_id, vm_id, |vm| {
                    if vm.is_running(kind) {
                        let record = vm.operation_mut(kind);
                        record.status = OperationStatus::Error;
                        record.task_id = None;
                        record.log = Some(message.clone());
                    }
                });
                Err(message)
            }
        }
    }

    /// Block until `kind` leaves `running` for the VM, or the step timeout passes.
    pub async fn wait_for_operation(
        &self,
        wave_id: &str,
        vm_id: &str,
        kind: OperationKind,
    ) -> StepOutcome {
        let deadline = Instant::now() + self.config.step_timeout();
        let mut changes = self.store.subscribe();

        loop {
            let current = {
                let snapshot = changes.borrow_and_update();
                snapshot.vm(wave_id, vm_id).map(|vm| {
                    (
                        vm.status(kind),
                        vm.operation(kind).and_then(|record| record.log.clone()),
                    )
                })
            };

            match current {
                None => return StepOutcome::Gone,
                Some((Some(OperationStatus::Success), _)) => return StepOutcome::Succeeded,
                Some((Some(OperationStatus::Error), log)) => {
                    return StepOutcome::Failed(log.unwrap_or_default());
                }
                Some((Some(OperationStatus::Running), _)) => {}
                Some((_, _)) => return StepOutcome::NotStarted,
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return StepOutcome::Gone,
                Err(_) => return StepOutcome::TimedOut,
            }
        }
    }
}
