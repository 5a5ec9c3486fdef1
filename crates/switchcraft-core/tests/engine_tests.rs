mod mock_handler;

use mock_handler::{brocade_spec, MockHandler};
use std::collections::BTreeSet;
use switchcraft_core::{
    ApplyOptions, AuditRecord, DesiredState, DeviceConfig, EngineConfig, ErrorKind,
    HilConstraints, PortId, SwitchcraftEngine, Vlan,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    engine: SwitchcraftEngine,
    state: std::sync::Arc<std::sync::Mutex<mock_handler::MockState>>,
    _dir: TempDir,
    audit_path: std::path::PathBuf,
}

fn brocade_baseline() -> DeviceConfig {
    let mut config = DeviceConfig::new("core-sw1");
    let mut v1 = Vlan::new(1);
    for p in 1..=24u16 {
        v1.untagged_ports.insert(PortId::stacked(1, 1, p));
    }
    config.insert_vlan(v1);
    config.insert_vlan(Vlan::new(254));
    config
}

fn harness_with(config: DeviceConfig, hil: Option<HilConstraints>) -> Harness {
    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let engine_config = EngineConfig::builder()
        .audit_log_path(audit_path.to_string_lossy().to_string())
        .build();
    let engine = SwitchcraftEngine::with_hil(engine_config, hil).unwrap();

    let (handler, state) = MockHandler::new(brocade_spec("core-sw1", "192.168.254.2"), config);
    engine.register_handler(Box::new(handler));
    Harness {
        engine,
        state,
        _dir: dir,
        audit_path,
    }
}

fn harness() -> Harness {
    harness_with(brocade_baseline(), None)
}

fn audit_records(harness: &Harness) -> Vec<AuditRecord> {
    let content = std::fs::read_to_string(&harness.audit_path).unwrap_or_default();
    content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn servers_vlan_desired() -> DesiredState {
    DesiredState::from_json(
        r#"{
            "device_id": "core-sw1",
            "mode": "patch",
            "vlans": {
                "100": {
                    "name": "Servers",
                    "untagged_ports": ["1/1/5", "1/1/6", "1/1/7", "1/1/8"],
                    "tagged_ports": ["1/2/1"]
                }
            }
        }"#,
    )
    .unwrap()
}

#[tokio::test]
async fn apply_creates_vlan_with_canonical_plan_and_verifies() {
    let h = harness();
    let outcome = h
        .engine
        .apply_config("core-sw1", servers_vlan_desired(), ApplyOptions::default())
        .await
        .unwrap();

    assert!(outcome.verified);
    assert_eq!(
        outcome.plan.render(),
        vec![
            "configure terminal",
            "vlan 1",
            "no untagged ethe 1/1/5 to 1/1/8",
            "exit",
            "vlan 100 name Servers by port",
            "untagged ethe 1/1/5 to 1/1/8",
            "tagged ethe 1/2/1",
            "exit",
            "write memory",
        ]
    );

    let state = h.state.lock().unwrap();
    let v100 = &state.config.vlans[&100];
    assert_eq!(v100.name.as_deref(), Some("Servers"));
    let expected: BTreeSet<PortId> = ["1/1/5", "1/1/6", "1/1/7", "1/1/8"]
        .iter()
        .map(|p| p.parse().unwrap())
        .collect();
    assert_eq!(v100.untagged_ports, expected);
    assert!(!state.config.vlans[&1].untagged_ports.contains(&"1/1/5".parse().unwrap()));
    assert!(state.saved);
    drop(state);

    let records = audit_records(&h);
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert!(records[0].before_state.is_some());
    assert!(records[0].after_state.is_some());
}

#[tokio::test]
async fn second_apply_of_same_state_is_a_no_op() {
    let h = harness();
    h.engine
        .apply_config("core-sw1", servers_vlan_desired(), ApplyOptions::default())
        .await
        .unwrap();
    let writes_after_first = h.state.lock().unwrap().wire_writes.len();

    let outcome = h
        .engine
        .apply_config("core-sw1", servers_vlan_desired(), ApplyOptions::default())
        .await
        .unwrap();

    assert!(outcome.diff.is_empty());
    assert!(outcome.plan.main_commands.is_empty());
    // Second call fetched state but wrote nothing.
    assert_eq!(h.state.lock().unwrap().wire_writes.len(), writes_after_first);
    assert_eq!(audit_records(&h).len(), 2);
}

#[tokio::test]
async fn dry_run_never_touches_the_wire() {
    let h = harness();
    let outcome = h
        .engine
        .apply_config("core-sw1", servers_vlan_desired(), ApplyOptions::dry_run())
        .await
        .unwrap();

    assert!(outcome.dry_run);
    assert!(!outcome.plan.main_commands.is_empty());
    let state = h.state.lock().unwrap();
    // The current-state fetch happened, so the diff is real.
    assert_eq!(state.get_config_calls, 1);
    assert!(state.wire_writes.is_empty());
    drop(state);

    let records = audit_records(&h);
    assert_eq!(records.len(), 1);
    assert!(records[0].dry_run);
    assert!(records[0].success);
    assert!(records[0].after_state.is_none());
}

#[tokio::test]
async fn dual_mode_failure_is_recovered_automatically() {
    // Port 1/1/10 carries a dual-mode remnant the state fetch cannot see.
    let h = harness();
    h.state.lock().unwrap().fail_once.insert(
        "untagged ethe 1/1/10".to_string(),
        "Error - Please disable dual mode on port 1/1/10".to_string(),
    );

    let desired = DesiredState::from_json(
        r#"{"device_id": "core-sw1", "vlans": {"100": {"untagged_ports": ["1/1/10"]}}}"#,
    )
    .unwrap();
    let outcome = h
        .engine
        .apply_config("core-sw1", desired, ApplyOptions::default())
        .await
        .unwrap();

    assert!(outcome.verified);
    assert_eq!(outcome.recovery_attempts, 1);

    let state = h.state.lock().unwrap();
    assert!(state.config.vlans[&100]
        .untagged_ports
        .contains(&"1/1/10".parse().unwrap()));
    let writes = state.wire_writes.join("\n");
    assert!(writes.contains("interface ethe 1/1/10"));
    assert!(writes.contains("no dual-mode"));
    drop(state);

    let records = audit_records(&h);
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].recovery_attempts.len(), 1);
}

#[tokio::test]
async fn deleting_vlan_1_is_rejected_before_any_wire_activity() {
    let h = harness();
    let err = h
        .engine
        .delete_vlan("core-sw1", 1, ApplyOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("Cannot delete VLAN 1"));

    let state = h.state.lock().unwrap();
    assert!(state.wire_writes.is_empty());
    assert_eq!(state.get_config_calls, 0);
    drop(state);

    let records = audit_records(&h);
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
}

#[tokio::test]
async fn reserved_vlan_create_rejected() {
    let h = harness();
    let err = h
        .engine
        .create_vlan("core-sw1", Vlan::new(4087), ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.state.lock().unwrap().wire_writes.is_empty());
}

#[tokio::test]
async fn hil_mode_blocks_writes_before_any_connection() {
    let h = harness_with(brocade_baseline(), Some(HilConstraints::default()));
    let err = h
        .engine
        .create_vlan(
            "core-sw1",
            Vlan::new(100).with_name("Servers"),
            ApplyOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SafetyViolation);
    let state = h.state.lock().unwrap();
    assert_eq!(state.get_config_calls, 0);
    assert!(state.wire_writes.is_empty());
    drop(state);

    let records = audit_records(&h);
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
}

#[tokio::test]
async fn hil_mode_allows_the_sandbox_vlan() {
    let h = harness_with(brocade_baseline(), Some(HilConstraints::default()));
    let outcome = h
        .engine
        .create_vlan("core-sw1", Vlan::new(999), ApplyOptions::default())
        .await
        .unwrap();
    assert!(outcome.verified);
}

#[tokio::test]
async fn cancellation_mid_batch_rolls_back_executed_commands() {
    let h = harness();
    let before = h.state.lock().unwrap().config.clone();

    let cancel = CancellationToken::new();
    // Pre-command plus the three eviction commands, then cancel.
    h.state.lock().unwrap().cancel_after = Some((4, cancel.clone()));

    let opts = ApplyOptions {
        cancel,
        ..Default::default()
    };
    let err = h
        .engine
        .apply_config("core-sw1", servers_vlan_desired(), opts)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let state = h.state.lock().unwrap();
    assert_eq!(state.config, before);
    assert!(!state.config.vlans.contains_key(&100));
    drop(state);

    let records = audit_records(&h);
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].error.as_deref().unwrap().to_lowercase().contains("cancel"));
}

#[tokio::test]
async fn cancellation_before_execution_leaves_no_audit_record() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let opts = ApplyOptions {
        cancel,
        ..Default::default()
    };
    let err = h
        .engine
        .apply_config("core-sw1", servers_vlan_desired(), opts)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(h.state.lock().unwrap().wire_writes.is_empty());
    assert!(audit_records(&h).is_empty());
}

#[tokio::test]
async fn failed_rollback_surfaces_as_rollback_failed() {
    let h = harness();
    {
        let mut state = h.state.lock().unwrap();
        state.fail_once.insert(
            "untagged ethe 1/1/5 to 1/1/8".to_string(),
            "Invalid input -> untagged".to_string(),
        );
        state.fail_once.insert(
            "no vlan 100".to_string(),
            "Invalid input -> no vlan".to_string(),
        );
    }

    let err = h
        .engine
        .apply_config("core-sw1", servers_vlan_desired(), ApplyOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RollbackFailed);
    let records = audit_records(&h);
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].error.as_deref().unwrap().contains("Rollback failed"));
}

#[tokio::test]
async fn rollback_restores_pre_state_after_vendor_reject() {
    let h = harness();
    let before = h.state.lock().unwrap().config.clone();
    h.state.lock().unwrap().fail_once.insert(
        "tagged ethe 1/2/1".to_string(),
        "Invalid input -> tagged".to_string(),
    );

    let err = h
        .engine
        .apply_config("core-sw1", servers_vlan_desired(), ApplyOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::VendorReject);
    let state = h.state.lock().unwrap();
    assert_eq!(state.config, before);
}

#[tokio::test]
async fn drift_report_is_read_only_and_unaudited() {
    let h = harness();
    let report = h
        .engine
        .drift_report("core-sw1", &servers_vlan_desired())
        .await
        .unwrap();

    assert!(!report.clean());
    assert_eq!(report.missing, 1);
    assert!(h.state.lock().unwrap().wire_writes.is_empty());
    assert!(audit_records(&h).is_empty());
}

#[tokio::test]
async fn unknown_device_is_a_validation_error() {
    let h = harness();
    let err = h.engine.get_config("no-such-switch").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn apply_config_many_fans_out_across_devices() {
    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let engine_config = EngineConfig::builder()
        .audit_log_path(audit_path.to_string_lossy().to_string())
        .build();
    let engine = SwitchcraftEngine::with_hil(engine_config, None).unwrap();

    for id in ["sw-a", "sw-b"] {
        let mut config = DeviceConfig::new(id);
        config.insert_vlan(Vlan::new(1));
        let (handler, _) = MockHandler::new(brocade_spec(id, id), config);
        engine.register_handler(Box::new(handler));
    }

    let states: Vec<DesiredState> = ["sw-a", "sw-b"]
        .iter()
        .map(|id| {
            DesiredState::from_json(&format!(
                r#"{{"device_id": "{}", "vlans": {{"100": {{"untagged_ports": ["1/1/5"]}}}}}}"#,
                id
            ))
            .unwrap()
        })
        .collect();

    let results = engine
        .apply_config_many(states, ApplyOptions::default(), 4)
        .await;
    assert_eq!(results.len(), 2);
    for (device_id, result) in results {
        let outcome = result.unwrap();
        assert!(outcome.verified, "apply failed on {}", device_id);
    }
}
