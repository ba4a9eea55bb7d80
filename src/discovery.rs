use crate::orchestrator::Orchestrator;
use crate::{Result, WaveError};

impl Orchestrator {
    /// Replace the discovery list with the VMs currently on `host_id`.
    ///
    /// The list is cleared before the request and stays empty when it fails.
    pub async fn fetch_vms_for_host(&self, host_id: &str) -> Result<usize> {
        let Some(host) = self.store.host_with_credentials(host_id) else {
            self.notices
                .error("Error", "Host details or credentials not found.");
            return Err(WaveError::HostNotFound(host_id.to_string()));
        };

        self.store.replace_discovered_vms(Vec::new());

        match self.backend.list_vms(&host).await {
            Ok(mut vms) => {
                for vm in &mut vms {
                    vm.host_id = host.id.clone();
                }
                let count = vms.len();
                self.store.replace_discovered_vms(vms);
                self.notices.info(
                    "VMs Fetched",
                    format!("Successfully fetched {} VMs from {}.", count, host.address),
                );
                Ok(count)
            }
            Err(e) => {
                self.notices.error("Error Fetching VMs", e.detail());
                Err(e.into())
            }
        }
    }
}
