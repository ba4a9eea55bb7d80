use crate::model::{
    Host, HostSpec, MigrationWave, StageName, StageStatus, VirtualMachine,
};
use crate::{Result, WaveError, log_debug, log_info, log_warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

/// Immutable view of every collection the store holds.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub hosts: Vec<Host>,
    pub target_hosts: Vec<Host>,
    pub vms: Vec<VirtualMachine>,
    pub waves: Vec<MigrationWave>,
}

impl Snapshot {
    pub fn wave(&self, wave_id: &str) -> Option<&MigrationWave> {
        self.waves.iter().find(|wave| wave.id == wave_id)
    }

    pub fn wave_by_name(&self, name: &str) -> Option<&MigrationWave> {
        self.waves.iter().find(|wave| wave.name == name)
    }

    pub fn vm(&self, wave_id: &str, vm_id: &str) -> Option<&VirtualMachine> {
        self.wave(wave_id).and_then(|wave| wave.vm(vm_id))
    }

    /// Source or target host by id.
    pub fn host(&self, host_id: &str) -> Option<&Host> {
        self.hosts
            .iter()
            .chain(self.target_hosts.iter())
            .find(|host| host.id == host_id)
    }

    pub fn host_by_address(&self, address: &str) -> Option<&Host> {
        self.hosts.iter().find(|host| host.address == address)
    }

    pub fn target_host_by_address(&self, address: &str) -> Option<&Host> {
        self.target_hosts.iter().find(|host| host.address == address)
    }

    fn wave_mut(&mut self, wave_id: &str) -> Option<&mut MigrationWave> {
        self.waves.iter_mut().find(|wave| wave.id == wave_id)
    }
}

/// Process-wide state container. Cloning shares the same state.
///
/// Every mutation copies the current snapshot, applies a pure update and
/// publishes the result as a whole, so readers only ever see complete states.
#[derive(Clone)]
pub struct EntityStore {
    current: Arc<Mutex<Arc<Snapshot>>>,
    changes: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let initial = Arc::new(Snapshot::default());
        let (changes, _) = watch::channel(initial.clone());
        Self {
            current: Arc::new(Mutex::new(initial)),
            changes: Arc::new(changes),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receiver notified after every committed change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.changes.subscribe()
    }

    /// Read the current state, compute the next one, commit it if `update`
    /// reports a change. Never holds the lock across an await point.
    fn transact<R>(&self, update: impl FnOnce(&mut Snapshot) -> (R, bool)) -> R {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&current);
        let (value, changed) = update(&mut next);
        if changed {
            let next = Arc::new(next);
            *current = next.clone();
            self.changes.send_replace(next);
        }
        value
    }

    // Source hosts

    /// Add a source host. Returns false when the address is already known.
    pub fn add_host(&self, spec: HostSpec) -> bool {
        let address = spec.address.clone();
        let added = self.transact(|state| {
            if state.hosts.iter().any(|host| host.address == spec.address) {
                return (false, false);
            }
            let id = format!("source-host-{}", Uuid::new_v4());
            state.hosts.push(Host::from_spec(id, spec));
            (true, true)
        });

        if added {
            log_info!("Added source host {}", address);
        } else {
            log_warn!("A source host with address {} already exists", address);
        }
        added
    }

    /// Replace a source host's details. A missing password keeps the stored one.
    pub fn update_host(&self, updated: Host) -> bool {
        self.transact(|state| {
            let changed = merge_host(&mut state.hosts, updated);
            (changed, changed)
        })
    }

    /// Remove a source host together with every VM it owns, in the discovery
    /// list and in every wave.
    pub fn delete_host(&self, host_id: &str) -> bool {
        let removed = self.transact(|state| {
            let before = state.hosts.len();
            state.hosts.retain(|host| host.id != host_id);
            if state.hosts.len() == before {
                return (false, false);
            }
            state.vms.retain(|vm| vm.host_id != host_id);
            for wave in &mut state.waves {
                wave.vms.retain(|vm| vm.host_id != host_id);
            }
            (true, true)
        });

        if removed {
            log_info!("Deleted source host {} and its VMs", host_id);
        }
        removed
    }

    // Migration target hosts

    pub fn add_target_host(&self, spec: HostSpec) -> bool {
        let address = spec.address.clone();
        let added = self.transact(|state| {
            if state
                .target_hosts
                .iter()
                .any(|host| host.address == spec.address)
            {
                return (false, false);
            }
            let id = format!("target-host-{}", Uuid::new_v4());
            state.target_hosts.push(Host::from_spec(id, spec));
            (true, true)
        });

        if added {
            log_info!("Added target host {}", address);
        } else {
            log_warn!("A target host with address {} already exists", address);
        }
        added
    }

    pub fn update_target_host(&self, updated: Host) -> bool {
        self.transact(|state| {
            let changed = merge_host(&mut state.target_hosts, updated);
            (changed, changed)
        })
    }

    pub fn delete_target_host(&self, host_id: &str) -> bool {
        self.transact(|state| {
            let before = state.target_hosts.len();
            state.target_hosts.retain(|host| host.id != host_id);
            let removed = state.target_hosts.len() != before;
            (removed, removed)
        })
    }

    // Discovery

    pub fn replace_discovered_vms(&self, vms: Vec<VirtualMachine>) {
        self.transact(|state| {
            state.vms = vms;
            ((), true)
        });
    }

    // Waves

    /// Create a wave from a snapshot of `vms` and return its id.
    pub fn create_wave(&self, name: &str, vms: Vec<VirtualMachine>) -> String {
        let wave = MigrationWave::new(name, vms);
        let id = wave.id.clone();
        let count = wave.vms.len();
        self.transact(|state| {
            state.waves.push(wave);
            ((), true)
        });
        log_info!("Created wave \"{}\" with {} VMs", name, count);
        id
    }

    pub fn rename_wave(&self, wave_id: &str, name: &str) -> bool {
        self.transact(|state| match state.wave_mut(wave_id) {
            Some(wave) => {
                wave.name = name.to_string();
                (true, true)
            }
            None => (false, false),
        })
    }

    /// Delete every listed wave. Returns how many existed.
    pub fn delete_waves(&self, wave_ids: &[String]) -> usize {
        self.transact(|state| {
            let before = state.waves.len();
            state.waves.retain(|wave| !wave_ids.contains(&wave.id));
            let removed = before - state.waves.len();
            (removed, removed > 0)
        })
    }

    /// Append VMs not already in the wave. Returns how many were added.
    pub fn add_vms_to_wave(&self, wave_id: &str, vms: Vec<VirtualMachine>) -> usize {
        let added = self.transact(|state| {
            let Some(wave) = state.wave_mut(wave_id) else {
                return (0, false);
            };
            let mut present: HashSet<String> = wave.vms.iter().map(|vm| vm.id.clone()).collect();
            let fresh: Vec<VirtualMachine> = vms
                .into_iter()
                .filter(|vm| present.insert(vm.id.clone()))
                .collect();
            let count = fresh.len();
            wave.vms.extend(fresh);
            (count, count > 0)
        });
        log_debug!("Added {} new VM(s) to wave {}", added, wave_id);
        added
    }

    /// Remove the listed VM ids from a wave. Unknown ids are ignored.
    pub fn remove_vms_from_wave(&self, wave_id: &str, vm_ids: &[String]) -> usize {
        self.transact(|state| {
            let Some(wave) = state.wave_mut(wave_id) else {
                return (0, false);
            };
            let before = wave.vms.len();
            wave.vms.retain(|vm| !vm_ids.contains(&vm.id));
            let removed = before - wave.vms.len();
            (removed, removed > 0)
        })
    }

    /// Point the listed VMs at a migration target host.
    pub fn map_target_to_vms(
        &self,
        wave_id: &str,
        vm_ids: &[String],
        target_host_id: &str,
    ) -> Result<usize> {
        self.transact(|state| {
            let Some(address) = state
                .target_hosts
                .iter()
                .find(|host| host.id == target_host_id)
                .map(|host| host.address.clone())
            else {
                return (
                    Err(WaveError::HostNotFound(target_host_id.to_string())),
                    false,
                );
            };
            let Some(wave) = state.wave_mut(wave_id) else {
                return (Ok(0), false);
            };
            let mut mapped = 0;
            for vm in wave.vms.iter_mut().filter(|vm| vm_ids.contains(&vm.id)) {
                vm.target_name = Some(address.clone());
                mapped += 1;
            }
            (Ok(mapped), mapped > 0)
        })
    }

    /// Apply `update` to one VM copy inside a wave. Missing ids are a no-op.
    pub fn update_vm(
        &self,
        wave_id: &str,
        vm_id: &str,
        update: impl FnOnce(&mut VirtualMachine),
    ) -> bool {
        self.transact(|state| {
            match state.wave_mut(wave_id).and_then(|wave| wave.vm_mut(vm_id)) {
                Some(vm) => {
                    update(vm);
                    (true, true)
                }
                None => (false, false),
            }
        })
    }

    /// Put a wave stage into `running`, re-entering it from any earlier result.
    pub fn begin_stage(&self, wave_id: &str, stage: StageName) -> bool {
        self.transact(|state| match state.wave_mut(wave_id) {
            Some(wave) => {
                wave.stage_mut(stage).begin();
                (true, true)
            }
            None => (false, false),
        })
    }

    /// Settle a running stage with `success` or `failure`.
    pub fn finish_stage(
        &self,
        wave_id: &str,
        stage: StageName,
        outcome: StageStatus,
        content: Option<String>,
    ) -> bool {
        let settled = self.transact(|state| match state.wave_mut(wave_id) {
            Some(wave) => {
                let settled = wave.stage_mut(stage).finish(outcome, content);
                (settled, settled)
            }
            None => (false, false),
        });
        if !settled {
            log_debug!("Stage {} of wave {} was not running; left as is", stage, wave_id);
        }
        settled
    }

    /// Move a stage to `status`. `running` always re-enters, terminal outcomes
    /// only settle a running stage, `pending` resets it.
    pub fn update_wave_stage(
        &self,
        wave_id: &str,
        stage: StageName,
        status: StageStatus,
        content: Option<String>,
    ) -> bool {
        match status {
            StageStatus::Running => self.transact(|state| match state.wave_mut(wave_id) {
                Some(wave) => {
                    let entry = wave.stage_mut(stage);
                    entry.begin();
                    if content.is_some() {
                        entry.content = content;
                    }
                    (true, true)
                }
                None => (false, false),
            }),
            StageStatus::Success | StageStatus::Failure => {
                self.finish_stage(wave_id, stage, status, content)
            }
            StageStatus::Pending => self.transact(|state| match state.wave_mut(wave_id) {
                Some(wave) => {
                    let entry = wave.stage_mut(stage);
                    entry.status = StageStatus::Pending;
                    if content.is_some() {
                        entry.content = content;
                    }
                    (true, true)
                }
                None => (false, false),
            }),
        }
    }

    /// Source or target host by id, only when it carries a password.
    pub fn host_with_credentials(&self, host_id: &str) -> Option<Host> {
        self.snapshot()
            .host(host_id)
            .filter(|host| host.has_credentials())
            .cloned()
    }
}

fn merge_host(hosts: &mut [Host], mut updated: Host) -> bool {
    let Some(existing) = hosts.iter_mut().find(|host| host.id == updated.id) else {
        return false;
    };
    if updated.password.is_none() {
        updated.password = existing.password.take();
    }
    *existing = updated;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationKind, OperationRecord, OperationStatus};

    fn spec(address: &str) -> HostSpec {
        HostSpec {
            address: address.to_string(),
            username: "root".to_string(),
            password: Some("secret".to_string()),
            management: None,
        }
    }

    fn vm(id: &str, host_id: &str) -> VirtualMachine {
        VirtualMachine::new(id, format!("vm-{id}"), host_id)
    }

    #[test]
    fn add_host_rejects_duplicate_address() {
        let store = EntityStore::new();
        assert!(store.add_host(spec("10.0.0.1")));
        assert!(!store.add_host(spec("10.0.0.1")));
        assert!(store.add_target_host(spec("10.0.0.1")));
        assert!(!store.add_target_host(spec("10.0.0.1")));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.hosts.len(), 1);
        assert_eq!(snapshot.target_hosts.len(), 1);
    }

    #[test]
    fn update_host_keeps_password_when_omitted() {
        let store = EntityStore::new();
        store.add_host(spec("10.0.0.1"));
        let mut host = store.snapshot().hosts[0].clone();
        host.username = "admin".into();
        host.password = None;

        assert!(store.update_host(host));
        let stored = &store.snapshot().hosts[0];
        assert_eq!(stored.username, "admin");
        assert_eq!(stored.password.as_deref(), Some("secret"));
    }

    #[test]
    fn delete_host_cascades_into_waves() {
        let store = EntityStore::new();
        store.add_host(spec("10.0.0.1"));
        store.add_host(spec("10.0.0.2"));
        let snapshot = store.snapshot();
        let host_a = snapshot.hosts[0].id.clone();
        let host_b = snapshot.hosts[1].id.clone();

        store.replace_discovered_vms(vec![vm("v1", &host_a), vm("v2", &host_b)]);
        let wave_id = store.create_wave("W", vec![vm("v1", &host_a), vm("v2", &host_b)]);

        assert!(store.delete_host(&host_a));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.vms.len(), 1);
        let wave = snapshot.wave(&wave_id).unwrap();
        assert!(wave.vm("v1").is_none());
        assert!(wave.vm("v2").is_some());
    }

    #[test]
    fn add_vms_to_wave_is_idempotent() {
        let store = EntityStore::new();
        let wave_id = store.create_wave("W", vec![vm("v1", "h")]);

        assert_eq!(store.add_vms_to_wave(&wave_id, vec![vm("v1", "h"), vm("v2", "h")]), 1);
        assert_eq!(store.add_vms_to_wave(&wave_id, vec![vm("v1", "h"), vm("v2", "h")]), 0);
        assert_eq!(store.snapshot().wave(&wave_id).unwrap().vms.len(), 2);
        assert_eq!(store.add_vms_to_wave("missing", vec![vm("v3", "h")]), 0);
    }

    #[test]
    fn remove_unknown_vm_leaves_wave_untouched() {
        let store = EntityStore::new();
        let wave_id = store.create_wave("W", vec![vm("v1", "h"), vm("v2", "h")]);
        let before = store.snapshot().wave(&wave_id).unwrap().vms.clone();

        assert_eq!(store.remove_vms_from_wave(&wave_id, &["nope".to_string()]), 0);
        assert_eq!(store.snapshot().wave(&wave_id).unwrap().vms, before);

        assert_eq!(store.remove_vms_from_wave(&wave_id, &["v1".to_string()]), 1);
        assert_eq!(store.snapshot().wave(&wave_id).unwrap().vms.len(), 1);
    }

    #[test]
    fn wave_copies_evolve_independently() {
        let store = EntityStore::new();
        store.replace_discovered_vms(vec![vm("v1", "h")]);
        let wave_id = store.create_wave("W", store.snapshot().vms.clone());

        store.update_vm(&wave_id, "v1", |vm| {
            vm.set_operation(OperationKind::Clone, OperationRecord::running(Some("task-1".into())));
        });

        let snapshot = store.snapshot();
        assert!(snapshot.vms[0].operations.is_empty());
        assert!(snapshot.vm(&wave_id, "v1").unwrap().is_running(OperationKind::Clone));
    }

    #[test]
    fn update_vm_on_missing_ids_is_noop() {
        let store = EntityStore::new();
        let wave_id = store.create_wave("W", vec![vm("v1", "h")]);
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        assert!(!store.update_vm(&wave_id, "ghost", |vm| vm.name = "x".into()));
        assert!(!store.update_vm("ghost-wave", "v1", |vm| vm.name = "x".into()));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn rename_and_delete_waves() {
        let store = EntityStore::new();
        let a = store.create_wave("A", vec![]);
        let b = store.create_wave("B", vec![]);

        assert!(store.rename_wave(&a, "Alpha"));
        assert!(!store.rename_wave("missing", "x"));
        assert_eq!(store.snapshot().wave(&a).unwrap().name, "Alpha");

        assert_eq!(store.delete_waves(&[a.clone(), "missing".to_string()]), 1);
        assert!(store.snapshot().wave(&a).is_none());
        assert!(store.snapshot().wave(&b).is_some());
    }

    #[test]
    fn map_target_sets_target_address() {
        let store = EntityStore::new();
        store.add_target_host(spec("192.168.50.10"));
        let target_id = store.snapshot().target_hosts[0].id.clone();
        let wave_id = store.create_wave("W", vec![vm("v1", "h"), vm("v2", "h")]);

        let mapped = store
            .map_target_to_vms(&wave_id, &["v2".to_string()], &target_id)
            .unwrap();
        assert_eq!(mapped, 1);
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.vm(&wave_id, "v2").unwrap().target_name.as_deref(),
            Some("192.168.50.10")
        );
        assert!(snapshot.vm(&wave_id, "v1").unwrap().target_name.is_none());

        assert!(store.map_target_to_vms(&wave_id, &[], "missing").is_err());
    }

    #[test]
    fn stage_updates_follow_lifecycle() {
        let store = EntityStore::new();
        let wave_id = store.create_wave("W", vec![]);

        assert!(!store.finish_stage(&wave_id, StageName::PreCheck, StageStatus::Success, None));
        assert!(store.begin_stage(&wave_id, StageName::PreCheck));
        assert!(store.finish_stage(&wave_id, StageName::PreCheck, StageStatus::Success, None));

        assert!(store.begin_stage(&wave_id, StageName::InstallAgent));
        let snapshot = store.snapshot();
        let wave = snapshot.wave(&wave_id).unwrap();
        assert_eq!(wave.stages.len(), 4);
        assert_eq!(wave.stage(StageName::PreCheck).unwrap().status, StageStatus::Success);
        assert_eq!(
            wave.stage(StageName::InstallAgent).unwrap().status,
            StageStatus::Running
        );
    }

    #[test]
    fn update_wave_stage_upserts_and_settles() {
        let store = EntityStore::new();
        let wave_id = store.create_wave("W", vec![]);

        assert!(store.update_wave_stage(&wave_id, StageName::PingTest, StageStatus::Running, None));
        assert!(store.update_wave_stage(
            &wave_id,
            StageName::PingTest,
            StageStatus::Failure,
            Some("2 of 3 hosts unreachable".into())
        ));
        let snapshot = store.snapshot();
        let stage = snapshot.wave(&wave_id).unwrap().stage(StageName::PingTest).unwrap();
        assert_eq!(stage.status, StageStatus::Failure);
        assert_eq!(stage.content.as_deref(), Some("2 of 3 hosts unreachable"));

        assert!(!store.update_wave_stage("missing", StageName::PingTest, StageStatus::Running, None));
    }

    #[test]
    fn running_stage_and_content_commit_together() {
        let store = EntityStore::new();
        let wave_id = store.create_wave("W", vec![]);
        store.begin_stage(&wave_id, StageName::Replication);
        store.finish_stage(
            &wave_id,
            StageName::Replication,
            StageStatus::Failure,
            Some("VM status check failed.".into()),
        );
        let mut rx = store.subscribe();
        let _ = rx.borrow_and_update();

        assert!(store.update_wave_stage(
            &wave_id,
            StageName::Replication,
            StageStatus::Running,
            Some("Checking 3 VMs".into())
        ));

        let seen = rx.borrow_and_update().clone();
        let stage = seen.wave(&wave_id).unwrap().stage(StageName::Replication).unwrap();
        assert_eq!(stage.status, StageStatus::Running);
        assert_eq!(stage.content.as_deref(), Some("Checking 3 VMs"));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn host_with_credentials_requires_password() {
        let store = EntityStore::new();
        store.add_host(spec("10.0.0.1"));
        store.add_target_host(HostSpec {
            password: None,
            ..spec("10.0.0.2")
        });
        let snapshot = store.snapshot();

        assert!(store.host_with_credentials(&snapshot.hosts[0].id).is_some());
        assert!(store.host_with_credentials(&snapshot.target_hosts[0].id).is_none());
        assert!(store.host_with_credentials("nope").is_none());
    }

    #[test]
    fn subscribers_see_committed_changes() {
        let store = EntityStore::new();
        let mut rx = store.subscribe();
        let wave_id = store.create_wave("W", vec![vm("v1", "h")]);

        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert!(seen.wave(&wave_id).is_some());

        store.update_vm(&wave_id, "v1", |vm| {
            vm.set_operation(OperationKind::Ping, OperationRecord::new(OperationStatus::Success));
        });
        assert!(rx.has_changed().unwrap());
    }
}
