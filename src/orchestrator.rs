use crate::backend::MigrationBackend;
use crate::config::PilotConfig;
use crate::model::{
    Host, HostSpec, MigrationWave, OperationKind, OperationRecord, OperationStatus,
    VirtualMachine,
};
use crate::notice::Notifier;
use crate::store::EntityStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Service object that owns the store and the backend and drives every stage.
///
/// Cloning is cheap and shares all state, so background tasks take their own
/// clone. Stage coordinators live in their own modules as `impl Orchestrator`
/// blocks.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: EntityStore,
    pub(crate) backend: Arc<dyn MigrationBackend>,
    pub(crate) notices: Notifier,
    pub(crate) config: Arc<PilotConfig>,
    pub(crate) background: CancellationToken,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn MigrationBackend>, config: PilotConfig) -> Self {
        Self::with_store(EntityStore::new(), backend, config)
    }

    pub fn with_store(
        store: EntityStore,
        backend: Arc<dyn MigrationBackend>,
        config: PilotConfig,
    ) -> Self {
        Self {
            store,
            backend,
            notices: Notifier::new(),
            config: Arc::new(config),
            background: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn notices(&self) -> &Notifier {
        &self.notices
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    /// Stop every background task started by this orchestrator: polling, log
    /// monitors and shutdown watchers.
    pub fn shutdown(&self) {
        self.background.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.background.is_cancelled()
    }

    /// Register a source host. A duplicate address is rejected with a notice.
    pub fn add_host(&self, spec: HostSpec) -> bool {
        let added = self.store.add_host(spec);
        if !added {
            self.notices.error(
                "Error adding host",
                "A source host with this IP address already exists.",
            );
        }
        added
    }

    /// Register a migration target host. A duplicate address is rejected with a notice.
    pub fn add_target_host(&self, spec: HostSpec) -> bool {
        let added = self.store.add_target_host(spec);
        if !added {
            self.notices.error(
                "Error adding host",
                "A migration target host with this IP address already exists.",
            );
        }
        added
    }

    pub(crate) fn wave(&self, wave_id: &str) -> Option<MigrationWave> {
        self.store.snapshot().wave(wave_id).cloned()
    }

    pub(crate) fn wave_vm(&self, wave_id: &str, vm_id: &str) -> Option<VirtualMachine> {
        self.store.snapshot().vm(wave_id, vm_id).cloned()
    }

    /// Credentialed source host owning `vm`.
    pub(crate) fn source_host(&self, vm: &VirtualMachine) -> Option<Host> {
        self.store.host_with_credentials(&vm.host_id)
    }

    /// Credentialed migration target host whose address matches the VM's target name.
    pub(crate) fn target_host(&self, vm: &VirtualMachine) -> Option<Host> {
        let target = vm.target_name.as_deref()?;
        self.store
            .snapshot()
            .target_host_by_address(target)
            .filter(|host| host.has_credentials())
            .cloned()
    }

    pub(crate) fn record(
        &self,
        wave_id: &str,
        vm_id: &str,
        kind: OperationKind,
        record: OperationRecord,
    ) -> bool {
        self.store
            .update_vm(wave_id, vm_id, |vm| vm.set_operation(kind, record))
    }

    /// Record `error` with a log line, dropping any in-flight task id.
    pub(crate) fn record_error(
        &self,
        wave_id: &str,
        vm_id: &str,
        kind: OperationKind,
        log: impl Into<String>,
    ) -> bool {
        let log = log.into();
        self.store.update_vm(wave_id, vm_id, |vm| {
            let record = vm.operation_mut(kind);
            record.status = OperationStatus::Error;
            record.task_id = None;
            record.log = Some(log);
        })
    }
}
