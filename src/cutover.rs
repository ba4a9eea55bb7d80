use crate::backend::FileCheckHost;
use crate::model::{
    OperationKind, OperationRecord, OperationStatus, OsType, PowerState, StageName, StageStatus,
};
use crate::orchestrator::Orchestrator;
use crate::{log_debug, log_info, log_warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

impl Orchestrator {
    /// Ping every VM of a wave by hostname in one batched request.
    ///
    /// VMs without a usable hostname fail without being sent. The `Ping Test`
    /// stage succeeds only when every VM answered.
    pub async fn perform_ping_test(&self, wave_id: &str) {
        let Some(wave) = self.wave(wave_id) else {
            return;
        };
        if wave.vms.is_empty() {
            self.notices
                .error("Ping Test Error", "No VMs in wave to perform ping test.");
            return;
        }

        self.store.begin_stage(wave_id, StageName::PingTest);

        let mut hostnames: Vec<String> = Vec::new();
        let mut pending: Vec<(String, String)> = Vec::new();
        for vm in &wave.vms {
            match vm.usable_hostname() {
                Some(hostname) => {
                    self.record(
                        wave_id,
                        &vm.id,
                        OperationKind::Ping,
                        OperationRecord::new(OperationStatus::Pending),
                    );
                    if !hostnames.iter().any(|h| h == hostname) {
                        hostnames.push(hostname.to_string());
                    }
                    pending.push((vm.id.clone(), hostname.to_string()));
                }
                None => {
                    self.record(
                        wave_id,
                        &vm.id,
                        OperationKind::Ping,
                        OperationRecord::new(OperationStatus::Error)
                            .with_log("No usable hostname."),
                    );
                }
            }
        }

        if !hostnames.is_empty() {
            match self.backend.ping(&hostnames).await {
                Ok(results) => {
                    for (vm_id, hostname) in &pending {
                        let record = match results.get(hostname) {
                            Some(word) => {
                                OperationRecord::new(OperationStatus::from_backend(word))
                            }
                            None => OperationRecord::new(OperationStatus::Error)
                                .with_log("No result returned for this hostname."),
                        };
                        self.record(wave_id, vm_id, OperationKind::Ping, record);
                    }
                }
                Err(e) => {
                    let detail = e.detail();
                    self.notices.error("Ping Test Error", detail.clone());
                    for (vm_id, _) in &pending {
                        self.record(
                            wave_id,
                            vm_id,
                            OperationKind::Ping,
                            OperationRecord::new(OperationStatus::Error).with_log(detail.clone()),
                        );
                    }
                }
            }
        }

        let (outcome, content) = match self.wave(wave_id) {
            Some(wave) => {
                let reached = wave
                    .vms
                    .iter()
                    .filter(|vm| vm.status(OperationKind::Ping) == Some(OperationStatus::Success))
                    .count();
                let outcome = if reached == wave.vms.len() {
                    StageStatus::Success
                } else {
                    StageStatus::Failure
                };
                (outcome, format!("{} of {} VMs reachable.", reached, wave.vms.len()))
            }
            None => return,
        };
        self.store
            .finish_stage(wave_id, StageName::PingTest, outcome, Some(content));
    }

    /// Count files (Linux) or collect check-disk summaries (Windows) on the
    /// source VM and, when known, on its live-sync target.
    pub async fn check_files_for_vm(&self, wave_id: &str, vm_id: &str) {
        let Some(vm) = self.wave_vm(wave_id, vm_id) else {
            return;
        };
        let (Some(source_ip), Some((username, password))) = (vm.usable_address(), vm.live_sync.login())
        else {
            self.notices.error(
                "File Check Failed",
                format!("VM credentials for {} not found.", vm.name),
            );
            return;
        };

        let source_ip = source_ip.to_string();
        let target_ip = vm.live_sync.target_ip.clone().filter(|ip| !ip.is_empty());
        let mut hosts = vec![FileCheckHost {
            ip_address: source_ip.clone(),
            username: username.to_string(),
            password: password.to_string(),
        }];
        if let Some(target_ip) = &target_ip {
            hosts.push(FileCheckHost {
                ip_address: target_ip.clone(),
                username: username.to_string(),
                password: password.to_string(),
            });
        }

        if vm.os_type == OsType::Windows {
            match self.backend.check_files_windows(&hosts).await {
                Ok(mut reports) => {
                    let source = reports.remove(&source_ip);
                    let target = target_ip.as_ref().and_then(|ip| reports.remove(ip));
                    if source.is_none() && target.is_none() {
                        return;
                    }
                    self.store.update_vm(wave_id, vm_id, |vm| {
                        if source.is_some() {
                            vm.files.source_disk_report = source;
                        }
                        if target.is_some() {
                            vm.files.target_disk_report = target;
                        }
                    });
                }
                Err(e) => self.notices.error("Error on check-files-windows", e.detail()),
            }
        } else {
            match self.backend.check_files(&hosts).await {
                Ok(counts) => {
                    let usable = |ip: &str| counts.get(ip).copied().filter(|count| *count >= 0);
                    let source = usable(&source_ip);
                    let target = target_ip.as_deref().and_then(usable);
                    if source.is_none() && target.is_none() {
                        log_warn!("File check returned no usable counts for {}", vm.name);
                        return;
                    }
                    self.store.update_vm(wave_id, vm_id, |vm| {
                        if source.is_some() {
                            vm.files.source_file_count = source;
                        }
                        if target.is_some() {
                            vm.files.target_file_count = target;
                        }
                    });
                }
                Err(e) => self.notices.error("Error on check-files", e.detail()),
            }
        }
    }

    /// Gracefully shut down the source VM.
    ///
    /// When the service reports the shutdown was initiated, a watcher re-checks
    /// the wave until the VM is powered off or the watch timeout elapses. The
    /// watcher handle is returned so callers can await it.
    pub async fn shutdown_source_vm(&self, wave_id: &str, vm_id: &str) -> Option<JoinHandle<()>> {
        let vm = self.wave_vm(wave_id, vm_id)?;

        let Some(host) = self.source_host(&vm) else {
            self.notices.error(
                "Shutdown Failed",
                format!("Credentials not found for host of VM {}.", vm.name),
            );
            self.record_error(
                wave_id,
                vm_id,
                OperationKind::Shutdown,
                "Source host credentials not found.",
            );
            return None;
        };

        self.record(
            wave_id,
            vm_id,
            OperationKind::Shutdown,
            OperationRecord::running(None).with_log("Shutdown requested."),
        );

        let response = match self.backend.shutdown_vm(&host, &vm.name).await {
            Ok(response) => response,
            Err(e) => {
                let detail = e.detail();
                self.notices.error("Shutdown Error", detail.clone());
                self.record_error(wave_id, vm_id, OperationKind::Shutdown, detail);
                return None;
            }
        };

        let message = response
            .message
            .clone()
            .unwrap_or_else(|| format!("Shutdown requested for {}.", vm.name));
        self.notices.info("Shutdown Initiated", message.clone());

        if response.already_off() {
            self.record(
                wave_id,
                vm_id,
                OperationKind::Shutdown,
                OperationRecord::new(OperationStatus::Success).with_log(message),
            );
            return None;
        }

        Some(self.spawn_power_off_watcher(wave_id, vm_id))
    }

    fn spawn_power_off_watcher(&self, wave_id: &str, vm_id: &str) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let token = self.background.child_token();
        let wave_id = wave_id.to_string();
        let vm_id = vm_id.to_string();
        let period = self.config.shutdown_watch_interval();
        let deadline = Instant::now() + self.config.shutdown_watch_timeout();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }

                orchestrator.check_vm_status_for_wave(&wave_id).await;

                let Some(vm) = orchestrator.wave_vm(&wave_id, &vm_id) else {
                    log_debug!("VM {} left wave {}, stopping power-off watch", vm_id, wave_id);
                    return;
                };
                if !vm.is_running(OperationKind::Shutdown) {
                    return;
                }
                if vm.power_state == PowerState::PoweredOff {
                    log_info!("{} is powered off", vm.name);
                    orchestrator.store.update_vm(&wave_id, &vm_id, |vm| {
                        let record = vm.operation_mut(OperationKind::Shutdown);
                        record.status = OperationStatus::Success;
                        record.log = Some("Powered off.".to_string());
                    });
                    return;
                }
                if Instant::now() >= deadline {
                    orchestrator.record_error(
                        &wave_id,
                        &vm_id,
                        OperationKind::Shutdown,
                        "Timed out waiting for the VM to power off.",
                    );
                    return;
                }
            }
        })
    }
}
