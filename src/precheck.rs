use crate::model::{StageName, StageStatus};
use crate::orchestrator::Orchestrator;
use crate::{Result, WaveError, log_info};

impl Orchestrator {
    /// Request the pre-check document for a wave and settle its `Pre-Check` stage.
    pub async fn generate_precheck_report(&self, wave_id: &str) -> Result<Vec<u8>> {
        let wave = self
            .wave(wave_id)
            .ok_or_else(|| WaveError::WaveNotFound(wave_id.to_string()))?;

        self.store.begin_stage(wave_id, StageName::PreCheck);

        let Some(first) = wave.vms.first() else {
            self.notices.error(
                "Report Generation Failed",
                "Cannot generate a report for an empty wave.",
            );
            self.fail_precheck(wave_id, "Wave has no VMs.");
            return Err(WaveError::Validation(format!("wave '{}' has no VMs", wave.name)));
        };

        let Some(host) = self.source_host(first) else {
            self.notices.error(
                "Report Generation Failed",
                "Source host credentials not found for VMs in this wave.",
            );
            self.fail_precheck(wave_id, "Host credentials not found.");
            return Err(WaveError::HostNotFound(first.host_id.clone()));
        };

        let vm_names: Vec<String> = wave.vms.iter().map(|vm| vm.name.clone()).collect();
        log_info!("Requesting pre-check report for {} VMs of wave \"{}\"", vm_names.len(), wave.name);

        match self.backend.precheck_report(&host, &vm_names).await {
            Ok(document) => {
                self.notices
                    .info("Report Generated", "Pre-check report generated successfully.");
                self.store.finish_stage(
                    wave_id,
                    StageName::PreCheck,
                    StageStatus::Success,
                    Some("Pre-Check report generated successfully.".to_string()),
                );
                Ok(document)
            }
            Err(e) => {
                let detail = e.detail();
                self.notices.error("Error Generating Report", detail.clone());
                self.fail_precheck(wave_id, &detail);
                Err(e.into())
            }
        }
    }

    fn fail_precheck(&self, wave_id: &str, reason: &str) {
        self.store.finish_stage(
            wave_id,
            StageName::PreCheck,
            StageStatus::Failure,
            Some(reason.to_string()),
        );
    }
}
