//! Background progress polling for clone, preparation and migration tasks.
//!
//! Every VM operation in `running` gets a tracker with its own child
//! cancellation token. The tracker is dropped (and its token cancelled) when
//! the VM leaves its wave or the operation settles, so a slow query for a
//! stale operation never folds back into the store.

use crate::backend::BackendError;
use crate::model::{OperationKind, OperationStatus, VirtualMachine};
use crate::orchestrator::Orchestrator;
use crate::{Result, WaveError, log_debug, log_error, log_warn};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One progress reading for a running operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: OperationStatus,
    pub progress: Option<u8>,
    pub log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TrackKey {
    wave_id: String,
    vm_id: String,
    kind: OperationKind,
}

struct Tracker {
    started: Instant,
    failures: u32,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct PollingScheduler {
    orchestrator: Orchestrator,
    token: CancellationToken,
    trackers: Arc<Mutex<HashMap<TrackKey, Tracker>>>,
}

impl PollingScheduler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let token = orchestrator.background.child_token();
        Self {
            orchestrator,
            token,
            trackers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Poll every `polling.interval_seconds` until [`shutdown`](Self::shutdown)
    /// or the orchestrator shuts down.
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let period = self.orchestrator.config.poll_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                scheduler.poll_once().await;
            }
            scheduler.cancel_all();
            log_debug!("Progress polling stopped");
        })
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Number of operations currently tracked.
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    /// Stop tracking every operation of one VM.
    pub fn cancel_vm(&self, wave_id: &str, vm_id: &str) {
        self.lock().retain(|key, tracker| {
            let keep = !(key.wave_id == wave_id && key.vm_id == vm_id);
            if !keep {
                tracker.token.cancel();
            }
            keep
        });
    }

    /// One scan: one query per VM with a running polled operation. Queries run
    /// concurrently, so a slow VM does not hold back the others.
    pub async fn poll_once(&self) {
        let active = self.sync_trackers();
        join_all(active.into_iter().map(|(key, vm)| self.poll_vm(key, vm))).await;
    }

    async fn poll_vm(&self, key: TrackKey, vm: VirtualMachine) {
        if self.token.is_cancelled() {
            return;
        }
        let Some((token, started)) = self.tracker_state(&key) else {
            return;
        };

        let limit = self.orchestrator.config.operation_timeout();
        if started.elapsed() >= limit {
            log_error!("{} of {} still running after {:?}, giving up", key.kind, vm.name, limit);
            self.orchestrator.record_error(
                &key.wave_id,
                &key.vm_id,
                key.kind,
                format!("No result after {} seconds.", limit.as_secs()),
            );
            self.untrack(&key);
            return;
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            outcome = self.orchestrator.query_progress(&vm, key.kind) => outcome,
        };

        match outcome {
            Ok(update) => {
                self.reset_failures(&key);
                if self.orchestrator.check_progress(&key.wave_id, &key.vm_id, key.kind, update) {
                    self.untrack(&key);
                }
            }
            Err(e) => self.note_failure(&key, &vm, e),
        }
    }

    /// Reconcile trackers with the store and return what needs a query.
    fn sync_trackers(&self) -> Vec<(TrackKey, VirtualMachine)> {
        let snapshot = self.orchestrator.store.snapshot();
        let mut active = Vec::new();
        for wave in &snapshot.waves {
            for vm in &wave.vms {
                if let Some(kind) = vm.active_polled_operation() {
                    let key = TrackKey {
                        wave_id: wave.id.clone(),
                        vm_id: vm.id.clone(),
                        kind,
                    };
                    active.push((key, vm.clone()));
                }
            }
        }

        let live: HashSet<&TrackKey> = active.iter().map(|(key, _)| key).collect();
        let mut trackers = self.lock();
        trackers.retain(|key, tracker| {
            let keep = live.contains(key);
            if !keep {
                tracker.token.cancel();
            }
            keep
        });
        for (key, _) in &active {
            trackers.entry(key.clone()).or_insert_with(|| Tracker {
                started: Instant::now(),
                failures: 0,
                token: self.token.child_token(),
            });
        }
        drop(trackers);

        active
    }

    fn tracker_state(&self, key: &TrackKey) -> Option<(CancellationToken, Instant)> {
        self.lock()
            .get(key)
            .map(|tracker| (tracker.token.clone(), tracker.started))
    }

    fn reset_failures(&self, key: &TrackKey) {
        if let Some(tracker) = self.lock().get_mut(key) {
            tracker.failures = 0;
        }
    }

    fn note_failure(&self, key: &TrackKey, vm: &VirtualMachine, error: WaveError) {
        let limit = self.orchestrator.config.polling.max_consecutive_failures;
        let failures = match self.lock().get_mut(key) {
            Some(tracker) => {
                tracker.failures += 1;
                tracker.failures
            }
            None => return,
        };

        if failures < limit {
            log_warn!(
                "Progress query {}/{} for {} of {} failed: {}",
                failures,
                limit,
                key.kind,
                vm.name,
                error
            );
            return;
        }

        log_error!("Giving up on {} of {} after {} failed queries", key.kind, vm.name, failures);
        self.orchestrator.record_error(
            &key.wave_id,
            &key.vm_id,
            key.kind,
            format!("Progress check failed {} times in a row: {}", failures, error),
        );
        self.untrack(key);
    }

    fn untrack(&self, key: &TrackKey) {
        if let Some(tracker) = self.lock().remove(key) {
            tracker.token.cancel();
        }
    }

    fn cancel_all(&self) {
        for (_, tracker) in self.lock().drain() {
            tracker.token.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TrackKey, Tracker>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Orchestrator {
    /// Start the progress poller for this orchestrator.
    pub fn start_polling(&self) -> (PollingScheduler, JoinHandle<()>) {
        let scheduler = PollingScheduler::new(self.clone());
        let handle = scheduler.spawn();
        (scheduler, handle)
    }

    /// Ask the service how far `kind` has come for `vm`.
    pub async fn query_progress(
        &self,
        vm: &VirtualMachine,
        kind: OperationKind,
    ) -> Result<ProgressUpdate> {
        match kind {
            OperationKind::Clone => {
                let task_id = vm
                    .operation(kind)
                    .and_then(|record| record.task_id.clone())
                    .ok_or_else(|| WaveError::Validation(format!("{} has no clone task", vm.name)))?;
                let host = self
                    .source_host(vm)
                    .ok_or_else(|| WaveError::HostNotFound(vm.host_id.clone()))?;

                match self.backend.task_progress(&host, &task_id).await {
                    Ok(task) => {
                        let status = match task.state.as_str() {
                            "success" => OperationStatus::Success,
                            "error" => OperationStatus::Error,
                            _ => OperationStatus::Running,
                        };
                        Ok(ProgressUpdate {
                            status,
                            progress: Some(percent(task.progress)),
                            log: None,
                        })
                    }
                    // The task is gone once it completes.
                    Err(BackendError::NotFound(_)) => Ok(ProgressUpdate {
                        status: OperationStatus::Success,
                        progress: Some(100),
                        log: None,
                    }),
                    Err(BackendError::Status { detail, .. }) => Ok(ProgressUpdate {
                        status: OperationStatus::Error,
                        progress: Some(0),
                        log: Some(detail),
                    }),
                    Err(e) => Err(e.into()),
                }
            }
            OperationKind::Preparation | OperationKind::Migration => {
                let clone_name = vm
                    .clone_name
                    .as_deref()
                    .ok_or_else(|| WaveError::Validation(format!("{} has no clone name", vm.name)))?;
                let report = if kind == OperationKind::Preparation {
                    self.backend.preparation_status(clone_name).await?
                } else {
                    self.backend.migration_status(clone_name).await?
                };
                Ok(ProgressUpdate {
                    status: OperationStatus::from_backend(&report.status),
                    progress: report.progress.map(percent),
                    log: report.logs,
                })
            }
            other => Err(WaveError::Validation(format!("{} is not polled", other))),
        }
    }

    /// Fold a progress reading into the store if the operation is still
    /// running. Returns true when the operation reached a terminal state.
    pub fn check_progress(
        &self,
        wave_id: &str,
        vm_id: &str,
        kind: OperationKind,
        update: ProgressUpdate,
    ) -> bool {
        // A reading of "pending" still means in flight.
        let status = match update.status {
            OperationStatus::Pending => OperationStatus::Running,
            other => other,
        };
        let mut settled = false;
        self.store.update_vm(wave_id, vm_id, |vm| {
            if !vm.is_running(kind) {
                return;
            }
            let record = vm.operation_mut(kind);
            record.status = status;
            if let Some(progress) = update.progress {
                record.progress = Some(progress);
            }
            if let Some(log) = update.log {
                record.log = Some(log);
            }
            if status.is_terminal() {
                record.task_id = None;
                settled = true;
            }
        });
        settled
    }
}

fn percent(value: f64) -> u8 {
    value.clamp(0.0, 100.0).round() as u8
}
