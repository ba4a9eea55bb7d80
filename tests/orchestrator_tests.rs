// Integration tests for the entity store and the early wave stages
mod common;

use common::{FakeBackend, SOURCE, Script, host, test_config, vm, wave_with};
use std::collections::HashSet;
use wavepilot::backend::VmStatusReport;
use wavepilot::cloning::{EXISTING_CLONE_TASK, NOT_POWERED_ON_TASK};
use wavepilot::model::{HostSpec, OsType};
use wavepilot::notice::NoticeLevel;
use wavepilot::{OperationKind, OperationStatus, Orchestrator, PowerState, StageName, StageStatus};

#[tokio::test]
async fn test_powered_off_vm_clones_without_request() {
    let backend = FakeBackend::new(Script::default());
    let (orchestrator, wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![vm("v1", "web01", PowerState::PoweredOff)],
    );

    orchestrator.initiate_cloning(&wave_id, &["v1".to_string()]).await;

    let vm = orchestrator.store().snapshot().vm(&wave_id, "v1").cloned().unwrap();
    let record = vm.operation(OperationKind::Clone).unwrap();
    assert_eq!(record.status, OperationStatus::Success);
    assert_eq!(record.task_id.as_deref(), Some(NOT_POWERED_ON_TASK));
    assert_eq!(vm.clone_name.as_deref(), Some("web01"));
    assert_eq!(backend.count("clone"), 0);
}

#[tokio::test]
async fn test_clone_records_task_or_existing_clone() {
    let backend = FakeBackend::new(Script {
        already_cloned: HashSet::from(["db01".to_string()]),
        ..Script::default()
    });
    let (orchestrator, wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![
            vm("v1", "web01", PowerState::PoweredOn),
            vm("v2", "db01", PowerState::PoweredOn),
        ],
    );

    orchestrator
        .initiate_cloning(&wave_id, &["v1".to_string(), "v2".to_string(), "ghost".to_string()])
        .await;

    let snapshot = orchestrator.store().snapshot();
    let web = snapshot.vm(&wave_id, "v1").unwrap();
    let record = web.operation(OperationKind::Clone).unwrap();
    assert_eq!(record.status, OperationStatus::Running);
    assert_eq!(record.task_id.as_deref(), Some("task-web01"));
    assert_eq!(record.progress, Some(0));
    assert_eq!(web.clone_name.as_deref(), Some("web01-clone"));

    let db = snapshot.vm(&wave_id, "v2").unwrap();
    let record = db.operation(OperationKind::Clone).unwrap();
    assert_eq!(record.status, OperationStatus::Success);
    assert_eq!(record.task_id.as_deref(), Some(EXISTING_CLONE_TASK));
    assert_eq!(record.progress, Some(100));
    assert_eq!(backend.count("clone"), 2);
}

#[tokio::test]
async fn test_clone_failure_is_isolated_per_vm() {
    let backend = FakeBackend::new(Script {
        clone_failures: HashSet::from(["web01".to_string()]),
        ..Script::default()
    });
    let (orchestrator, wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![
            vm("v1", "web01", PowerState::PoweredOn),
            vm("v2", "db01", PowerState::PoweredOn),
        ],
    );
    let mut notices = orchestrator.notices().subscribe();

    orchestrator
        .initiate_cloning(&wave_id, &["v1".to_string(), "v2".to_string()])
        .await;

    let snapshot = orchestrator.store().snapshot();
    let failed = snapshot.vm(&wave_id, "v1").unwrap().operation(OperationKind::Clone).unwrap();
    assert_eq!(failed.status, OperationStatus::Error);
    assert_eq!(failed.progress, Some(0));
    assert!(failed.task_id.is_none());
    assert!(snapshot.vm(&wave_id, "v2").unwrap().is_running(OperationKind::Clone));

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.level, NoticeLevel::Error);
    assert_eq!(notice.message, "Failed to start cloning for web01.");
}

#[tokio::test]
async fn test_missing_credentials_skip_clone() {
    let backend = FakeBackend::new(Script::default());
    let orchestrator = Orchestrator::new(backend.clone(), test_config());
    orchestrator.add_host(HostSpec {
        password: None,
        ..host(SOURCE)
    });
    let host_id = orchestrator.store().snapshot().hosts[0].id.clone();
    let mut machine = vm("v1", "web01", PowerState::PoweredOn);
    machine.host_id = host_id;
    let wave_id = orchestrator.store().create_wave("W", vec![machine]);

    orchestrator.initiate_cloning(&wave_id, &["v1".to_string()]).await;

    let snapshot = orchestrator.store().snapshot();
    assert!(snapshot.vm(&wave_id, "v1").unwrap().operations.is_empty());
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_preparation_requires_clone_name() {
    let backend = FakeBackend::new(Script::default());
    let (orchestrator, wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![vm("v1", "web01", PowerState::PoweredOn)],
    );

    orchestrator.prepare_clone_for_target(&wave_id, "v1").await;

    let vm = orchestrator.store().snapshot().vm(&wave_id, "v1").cloned().unwrap();
    let record = vm.operation(OperationKind::Preparation).unwrap();
    assert_eq!(record.status, OperationStatus::Error);
    assert!(record.log.as_deref().unwrap().contains("clone"));
    assert_eq!(backend.count("prepare"), 0);
}

#[tokio::test]
async fn test_preparation_and_target_creation_start_running() {
    let backend = FakeBackend::new(Script::default());
    let (orchestrator, wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![vm("v1", "web01", PowerState::PoweredOn)],
    );
    orchestrator
        .store()
        .update_vm(&wave_id, "v1", |vm| vm.clone_name = Some("web01-clone".into()));

    orchestrator.prepare_clone_for_target(&wave_id, "v1").await;
    orchestrator.create_target_vm(&wave_id, "v1").await;

    let vm = orchestrator.store().snapshot().vm(&wave_id, "v1").cloned().unwrap();
    let preparation = vm.operation(OperationKind::Preparation).unwrap();
    assert_eq!(preparation.status, OperationStatus::Running);
    assert_eq!(preparation.log.as_deref(), Some("Starting preparation..."));
    let migration = vm.operation(OperationKind::Migration).unwrap();
    assert_eq!(migration.status, OperationStatus::Running);
    assert_eq!(migration.log.as_deref(), Some("Initiating migration..."));
    assert_eq!(
        backend.calls(),
        vec![
            "prepare web01-clone".to_string(),
            format!("create_target web01-clone {}", common::TARGET),
        ]
    );
}

#[tokio::test]
async fn test_target_creation_requires_mapping() {
    let backend = FakeBackend::new(Script::default());
    let (orchestrator, wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![vm("v1", "web01", PowerState::PoweredOn)],
    );
    orchestrator.store().update_vm(&wave_id, "v1", |vm| {
        vm.clone_name = Some("web01-clone".into());
        vm.target_name = None;
    });

    orchestrator.create_target_vm(&wave_id, "v1").await;

    let vm = orchestrator.store().snapshot().vm(&wave_id, "v1").cloned().unwrap();
    assert_eq!(vm.status(OperationKind::Migration), Some(OperationStatus::Error));
    assert_eq!(backend.count("create_target"), 0);
}

#[tokio::test]
async fn test_fetch_vms_replaces_discovery_list() {
    let mut discovered = vm("v9", "app09", PowerState::PoweredOn);
    discovered.host_id = "whatever".into();
    let backend = FakeBackend::new(Script {
        vms: vec![discovered],
        ..Script::default()
    });
    let (orchestrator, _wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![vm("v1", "web01", PowerState::PoweredOn)],
    );
    let host_id = orchestrator.store().snapshot().hosts[0].id.clone();

    let count = orchestrator.fetch_vms_for_host(&host_id).await.unwrap();

    assert_eq!(count, 1);
    let snapshot = orchestrator.store().snapshot();
    assert_eq!(snapshot.vms.len(), 1);
    assert_eq!(snapshot.vms[0].name, "app09");
    assert_eq!(snapshot.vms[0].host_id, host_id);
    assert!(orchestrator.fetch_vms_for_host("unknown").await.is_err());
}

#[tokio::test]
async fn test_delete_host_removes_vms_everywhere() {
    let backend = FakeBackend::new(Script::default());
    let (orchestrator, wave_id) = wave_with(
        backend,
        test_config(),
        vec![
            vm("v1", "web01", PowerState::PoweredOn),
            vm("v2", "db01", PowerState::PoweredOff),
        ],
    );
    let host_id = orchestrator.store().snapshot().hosts[0].id.clone();

    assert!(orchestrator.store().delete_host(&host_id));

    let snapshot = orchestrator.store().snapshot();
    assert!(snapshot.vms.is_empty());
    assert!(snapshot.wave(&wave_id).unwrap().vms.is_empty());
    assert_eq!(snapshot.target_hosts.len(), 1);
}

#[tokio::test]
async fn test_duplicate_host_address_notifies_operator() {
    let backend = FakeBackend::new(Script::default());
    let (orchestrator, _wave_id) = wave_with(backend, test_config(), vec![]);
    let mut notices = orchestrator.notices().subscribe();

    assert!(!orchestrator.add_host(host(SOURCE)));
    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.level, NoticeLevel::Error);
    assert_eq!(notice.title, "Error adding host");
    assert_eq!(notice.message, "A source host with this IP address already exists.");

    assert!(!orchestrator.add_target_host(host(common::TARGET)));
    let notice = notices.try_recv().unwrap();
    assert_eq!(
        notice.message,
        "A migration target host with this IP address already exists."
    );

    assert!(orchestrator.add_host(host("10.0.0.6")));
    assert!(notices.try_recv().is_err());
    assert_eq!(orchestrator.store().snapshot().hosts.len(), 2);
}

#[tokio::test]
async fn test_precheck_report_settles_stage() {
    let backend = FakeBackend::new(Script::default());
    let (orchestrator, wave_id) = wave_with(
        backend.clone(),
        test_config(),
        vec![vm("v1", "web01", PowerState::PoweredOn)],
    );

    let document = orchestrator.generate_precheck_report(&wave_id).await.unwrap();
    assert!(document.starts_with(b"%PDF"));
    assert_eq!(backend.calls(), vec!["precheck web01".to_string()]);

    let empty = orchestrator.store().create_wave("Empty", vec![]);
    assert!(orchestrator.generate_precheck_report(&empty).await.is_err());

    let snapshot = orchestrator.store().snapshot();
    let stage = |id: &str| snapshot.wave(id).unwrap().stage(StageName::PreCheck).unwrap().status;
    assert_eq!(stage(&wave_id), StageStatus::Success);
    assert_eq!(stage(&empty), StageStatus::Failure);
}

#[tokio::test]
async fn test_replication_check_refreshes_wave() {
    let backend = FakeBackend::new(Script {
        vm_status: vec![
            VmStatusReport {
                name: "web01".into(),
                power_state: PowerState::PoweredOff,
                guest_os: Some("Microsoft Windows Server 2019".into()),
                os_type: OsType::Windows,
            },
            VmStatusReport {
                name: "db01".into(),
                power_state: PowerState::PoweredOn,
                guest_os: Some("Ubuntu Linux (64-bit)".into()),
                os_type: OsType::Linux,
            },
            VmStatusReport {
                name: "old01".into(),
                power_state: PowerState::Absent,
                guest_os: Some("N/A".into()),
                os_type: OsType::Unknown,
            },
        ],
        ..Script::default()
    });
    let (orchestrator, wave_id) = wave_with(
        backend,
        test_config(),
        vec![
            vm("v1", "web01", PowerState::PoweredOn),
            vm("v2", "db01", PowerState::Unknown),
            vm("v3", "old01", PowerState::PoweredOn),
        ],
    );

    assert!(orchestrator.run_replication_check(&wave_id).await);

    let order: Vec<String> = orchestrator
        .replication_candidates(&wave_id)
        .into_iter()
        .map(|vm| vm.name)
        .collect();
    assert_eq!(order, vec!["db01", "web01", "old01"]);

    let snapshot = orchestrator.store().snapshot();
    let wave = snapshot.wave(&wave_id).unwrap();
    assert_eq!(wave.vm("v1").unwrap().os_type, OsType::Windows);
    assert_eq!(
        wave.stage(StageName::Replication).unwrap().status,
        StageStatus::Success
    );
}
