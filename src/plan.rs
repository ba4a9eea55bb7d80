//! Operator plan file: the hosts and waves a CLI session works with.
//!
//! ```toml
//! [[source_hosts]]
//! address = "10.0.0.5"
//! username = "administrator@vsphere.local"
//! password = "..."
//!
//! [[target_hosts]]
//! address = "172.16.0.20"
//! username = "admin"
//! password = "..."
//! management = { fqdn = "vme.lab.local", api_key = "..." }
//!
//! [[waves]]
//! name = "Phase1"
//! source_host = "10.0.0.5"
//! vms = ["web01", "db01"]
//! target = "172.16.0.20"
//! ```

use crate::model::HostSpec;
use crate::orchestrator::Orchestrator;
use crate::{Result, WaveError, log_info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WavePlan {
    pub name: String,
    /// Address of the source host the VMs live on.
    pub source_host: String,
    #[serde(default)]
    pub vms: Vec<String>,
    /// Address of the migration target host, if already decided.
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationPlan {
    #[serde(default)]
    pub source_hosts: Vec<HostSpec>,
    #[serde(default)]
    pub target_hosts: Vec<HostSpec>,
    #[serde(default)]
    pub waves: Vec<WavePlan>,
}

impl MigrationPlan {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let plan: MigrationPlan = toml::from_str(contents)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for wave in &self.waves {
            if !names.insert(wave.name.as_str()) {
                return Err(WaveError::ConfigError(format!(
                    "wave '{}' is defined more than once",
                    wave.name
                )));
            }
            if !self.source_hosts.iter().any(|h| h.address == wave.source_host) {
                return Err(WaveError::ConfigError(format!(
                    "wave '{}' refers to unknown source host {}",
                    wave.name, wave.source_host
                )));
            }
            if let Some(target) = &wave.target {
                if !self.target_hosts.iter().any(|h| &h.address == target) {
                    return Err(WaveError::ConfigError(format!(
                        "wave '{}' refers to unknown target host {}",
                        wave.name, target
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn wave(&self, name: &str) -> Option<&WavePlan> {
        self.waves.iter().find(|wave| wave.name == name)
    }

    /// Register every host of the plan. Hosts already known are left alone.
    pub fn register_hosts(&self, orchestrator: &Orchestrator) {
        let known = orchestrator.store().snapshot();
        for host in &self.source_hosts {
            if known.host_by_address(&host.address).is_none() {
                orchestrator.add_host(host.clone());
            }
        }
        for host in &self.target_hosts {
            if known.target_host_by_address(&host.address).is_none() {
                orchestrator.add_target_host(host.clone());
            }
        }
    }

    /// Discover the wave's source host, create the wave from the listed VMs
    /// and map them to the planned target. Returns the new wave id.
    pub async fn materialize_wave(&self, orchestrator: &Orchestrator, name: &str) -> Result<String> {
        let plan = self
            .wave(name)
            .ok_or_else(|| WaveError::WaveNotFound(name.to_string()))?;
        self.register_hosts(orchestrator);

        let host_id = orchestrator
            .store()
            .snapshot()
            .host_by_address(&plan.source_host)
            .map(|host| host.id.clone())
            .ok_or_else(|| WaveError::HostNotFound(plan.source_host.clone()))?;
        orchestrator.fetch_vms_for_host(&host_id).await?;

        let discovered = orchestrator.store().snapshot().vms.clone();
        let mut selected = Vec::with_capacity(plan.vms.len());
        for vm_name in &plan.vms {
            let vm = discovered
                .iter()
                .find(|vm| &vm.name == vm_name)
                .ok_or_else(|| WaveError::VmNotFound(vm_name.clone()))?;
            selected.push(vm.clone());
        }

        let vm_ids: Vec<String> = selected.iter().map(|vm| vm.id.clone()).collect();
        let wave_id = orchestrator.store().create_wave(&plan.name, selected);

        if let Some(target) = &plan.target {
            let target_id = orchestrator
                .store()
                .snapshot()
                .target_host_by_address(target)
                .map(|host| host.id.clone())
                .ok_or_else(|| WaveError::HostNotFound(target.clone()))?;
            let mapped = orchestrator
                .store()
                .map_target_to_vms(&wave_id, &vm_ids, &target_id)?;
            log_info!("Mapped {} VMs of \"{}\" to {}", mapped, plan.name, target);
        }

        Ok(wave_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
[[source_hosts]]
address = "10.0.0.5"
username = "root"
password = "pw"

[[target_hosts]]
address = "172.16.0.20"
username = "admin"
password = "pw"
management = { fqdn = "vme.lab", api_key = "key" }

[[waves]]
name = "Phase1"
source_host = "10.0.0.5"
vms = ["web01", "db01"]
target = "172.16.0.20"
"#;

    #[test]
    fn parses_plan() {
        let plan = MigrationPlan::from_str(PLAN).unwrap();
        assert_eq!(plan.source_hosts.len(), 1);
        assert_eq!(
            plan.target_hosts[0].management.as_ref().map(|m| m.fqdn.as_str()),
            Some("vme.lab")
        );
        let wave = plan.wave("Phase1").unwrap();
        assert_eq!(wave.vms, vec!["web01", "db01"]);
    }

    #[test]
    fn rejects_unknown_hosts_and_duplicate_waves() {
        let unknown_target = PLAN.replace("target = \"172.16.0.20\"", "target = \"172.16.0.99\"");
        assert!(MigrationPlan::from_str(&unknown_target).is_err());

        let duplicate = format!(
            "{}\n[[waves]]\nname = \"Phase1\"\nsource_host = \"10.0.0.5\"\n",
            PLAN
        );
        assert!(MigrationPlan::from_str(&duplicate).is_err());
    }
}
