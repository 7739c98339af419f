//! DeviceOrchestrator integration tests: failure detection, command
//! routing and hot connection updates over mock transports

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::common::{fast_settings, tcp_logo_record, tcp_record, wait_until, Harness};
use gwsrv::core::command::WriteOp;
use gwsrv::core::register_map::{RegisterEntry, RegisterMap, RegisterMaps};
use gwsrv::core::transport::{ProtocolConnection, TransportKind};
use gwsrv::runtime::{ConnectionState, DeviceOrchestrator};
use gwsrv::GwSrvError;

const WAIT: Duration = Duration::from_secs(2);

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

async fn wait_connected(orch: &DeviceOrchestrator, kind: TransportKind) {
    let sup = orch.supervisor(kind).unwrap();
    let mut rx = sup.subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("transport did not connect")
        .unwrap();
}

/// Single-register maps so one failed read is one failed cycle
fn stat_only_maps() -> RegisterMaps {
    let map = Arc::new(RegisterMap::new("stat-only", 1, vec![RegisterEntry::plain("stat", 17)]).unwrap());
    RegisterMaps {
        tcp: map.clone(),
        serial: map.clone(),
        logo: map,
    }
}

// ============================================================================
// Poll failure threshold
// ============================================================================

#[tokio::test]
async fn test_three_failed_reads_start_new_connect_cycle() {
    let h = Harness::with(stat_only_maps(), fast_settings());
    let conn = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let orch = DeviceOrchestrator::new(tcp_record("SN-1"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    let sup = orch.supervisor(TransportKind::Tcp).unwrap();
    assert_eq!(conn.connect_attempts(), 1);

    conn.fail_next_reads(3);
    assert!(wait_until(WAIT, || sup.stats().transport_lost == 1).await);
    assert!(wait_until(WAIT, || sup.stats().successful_connects == 2).await);
    assert_eq!(conn.connect_attempts(), 2);

    orch.stop().await;
}

#[tokio::test]
async fn test_two_failed_reads_then_success_keeps_polling() {
    let h = Harness::with(stat_only_maps(), fast_settings());
    let conn = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let orch = DeviceOrchestrator::new(tcp_record("SN-1"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    let sup = orch.supervisor(TransportKind::Tcp).unwrap();

    conn.fail_next_reads(2);
    let cycles = sup.poller().cycles();
    assert!(wait_until(WAIT, || sup.poller().cycles() >= cycles + 6).await);

    assert_eq!(sup.stats().transport_lost, 0);
    assert_eq!(conn.connect_attempts(), 1);
    assert_eq!(sup.poller().consecutive_failures(), 0);
    assert_eq!(sup.state(), ConnectionState::Connected);

    orch.stop().await;
}

// ============================================================================
// Command routing
// ============================================================================

#[tokio::test]
async fn test_turn_on_prefers_logo() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let logo = h.healthy_mock(TransportKind::Logo, "10.0.0.10:502");
    let orch = DeviceOrchestrator::new(tcp_logo_record("SN-2"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    wait_connected(&orch, TransportKind::Logo).await;

    assert_eq!(orch.turn_on().await.unwrap(), TransportKind::Logo);
    assert_eq!(logo.writes(), vec![WriteOp::Coil { address: 3, value: true }]);
    assert!(tcp.writes().is_empty());

    orch.stop().await;
}

#[tokio::test]
async fn test_turn_on_falls_back_to_drive_when_logo_rejects() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let logo = h.healthy_mock(TransportKind::Logo, "10.0.0.10:502");
    logo.reject_writes(true);
    let orch = DeviceOrchestrator::new(tcp_logo_record("SN-2"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    wait_connected(&orch, TransportKind::Logo).await;

    assert_eq!(orch.turn_on().await.unwrap(), TransportKind::Tcp);
    assert_eq!(tcp.writes(), vec![WriteOp::Register { address: 898, value: 3 }]);

    orch.stop().await;
}

#[tokio::test]
async fn test_turn_off_via_logo_sets_drive_local() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let logo = h.healthy_mock(TransportKind::Logo, "10.0.0.10:502");
    let orch = DeviceOrchestrator::new(tcp_logo_record("SN-3"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    wait_connected(&orch, TransportKind::Logo).await;

    assert_eq!(orch.turn_off().await.unwrap(), TransportKind::Logo);
    assert_eq!(logo.writes(), vec![WriteOp::Coil { address: 4, value: true }]);
    assert_eq!(tcp.writes(), vec![WriteOp::Register { address: 4358, value: 2 }]);

    orch.stop().await;
}

#[tokio::test]
async fn test_turn_off_succeeds_when_mode_write_fails() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    tcp.reject_register(4358);
    let orch = DeviceOrchestrator::new(tcp_record("SN-6"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;

    assert_eq!(orch.turn_off().await.unwrap(), TransportKind::Tcp);
    assert_eq!(tcp.writes(), vec![WriteOp::Register { address: 898, value: 0 }]);

    orch.stop().await;
}

#[tokio::test]
async fn test_turn_off_over_tcp_then_local() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let orch = DeviceOrchestrator::new(tcp_record("SN-7"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;

    assert_eq!(orch.turn_off().await.unwrap(), TransportKind::Tcp);
    assert_eq!(
        tcp.writes(),
        vec![
            WriteOp::Register { address: 898, value: 0 },
            WriteOp::Register { address: 4358, value: 2 },
        ]
    );

    orch.stop().await;
}

#[tokio::test]
async fn test_restart_over_tcp_writes_full_sequence() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let orch = DeviceOrchestrator::new(tcp_record("SN-4"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;

    assert_eq!(orch.restart().await.unwrap(), TransportKind::Tcp);
    assert_eq!(
        tcp.writes(),
        vec![
            WriteOp::Register { address: 901, value: 1 },
            WriteOp::Register { address: 901, value: 0 },
            WriteOp::Register { address: 898, value: 3 },
        ]
    );

    orch.stop().await;
}

#[tokio::test]
async fn test_command_without_connected_transport_fails() {
    let h = Harness::new();
    let orch = DeviceOrchestrator::new(tcp_logo_record("SN-5"), h.ctx.clone());

    let err = orch.turn_on().await.unwrap_err();
    assert!(matches!(err, GwSrvError::CommandError(_)));
    // LOGO has no mode registers and the drive is down
    assert!(orch.set_remote().await.is_err());
}

// ============================================================================
// Hot connection update
// ============================================================================

#[tokio::test]
async fn test_logo_ip_update_restarts_only_logo() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    h.healthy_mock(TransportKind::Logo, "10.0.0.10:502");
    let orch = DeviceOrchestrator::new(tcp_logo_record("SN-6"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    wait_connected(&orch, TransportKind::Logo).await;

    let tcp_sup = orch.supervisor(TransportKind::Tcp).unwrap();
    let old_logo_sup = orch.supervisor(TransportKind::Logo).unwrap();
    let since = tcp_sup.connected_since();
    let tcp_attempts = tcp.connect_attempts();
    let tcp_disconnects = tcp.disconnects();

    let new_logo = h.healthy_mock(TransportKind::Logo, "10.0.0.11:502");
    let report = orch
        .update_connection_config(&object(json!({"logoIp": "10.0.0.11"})))
        .await
        .unwrap();
    assert_eq!(report.restarted, vec![TransportKind::Logo]);
    assert!(!report.mode_changed);

    wait_connected(&orch, TransportKind::Logo).await;
    let logo_sup = orch.supervisor(TransportKind::Logo).unwrap();
    assert!(!Arc::ptr_eq(&logo_sup, &old_logo_sup));
    assert!(!old_logo_sup.is_supervising());
    assert!(new_logo.is_connected());
    assert_eq!(orch.connection_config().logo_ip.as_deref(), Some("10.0.0.11"));

    let same_tcp = orch.supervisor(TransportKind::Tcp).unwrap();
    assert!(Arc::ptr_eq(&same_tcp, &tcp_sup));
    assert_eq!(same_tcp.state(), ConnectionState::Connected);
    assert_eq!(same_tcp.connected_since(), since);
    assert_eq!(tcp.connect_attempts(), tcp_attempts);
    assert_eq!(tcp.disconnects(), tcp_disconnects);

    orch.stop().await;
}

#[tokio::test]
async fn test_update_with_unchanged_values_is_noop() {
    let h = Harness::new();
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let orch = DeviceOrchestrator::new(tcp_record("SN-7"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;

    let report = orch
        .update_connection_config(&object(json!({"host": "10.0.0.5", "color": "red"})))
        .await
        .unwrap();
    assert!(report.is_noop());
    assert_eq!(report.rejected_keys, vec!["color".to_string()]);
    assert_eq!(h.factory.built(TransportKind::Tcp).len(), 1);

    orch.stop().await;
}

#[tokio::test]
async fn test_bad_update_leaves_config_untouched() {
    let h = Harness::new();
    let orch = DeviceOrchestrator::new(tcp_record("SN-8"), h.ctx.clone());
    let before = orch.connection_config();

    let err = orch
        .update_connection_config(&object(json!({"tcpPort": [502]})))
        .await
        .unwrap_err();
    assert!(matches!(err, GwSrvError::ValidationError(_)));
    assert_eq!(orch.connection_config(), before);
}

#[tokio::test]
async fn test_mode_update_switches_drive_to_remote() {
    let h = Harness::new();
    let tcp = h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let orch = DeviceOrchestrator::new(tcp_record("SN-9"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;

    let report = orch
        .update_connection_config(&object(json!({"mode": "remote"})))
        .await
        .unwrap();
    assert!(report.mode_changed);
    assert!(report.restarted.is_empty());
    assert_eq!(tcp.writes(), vec![WriteOp::Register { address: 4358, value: 4 }]);

    orch.stop().await;
}

#[tokio::test]
async fn test_removing_logo_forgets_it() {
    let h = Harness::new();
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    h.healthy_mock(TransportKind::Logo, "10.0.0.10:502");
    let orch = DeviceOrchestrator::new(tcp_logo_record("SN-10"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    wait_connected(&orch, TransportKind::Logo).await;

    let report = orch
        .update_connection_config(&object(json!({"logoIp": null, "logoPort": null})))
        .await
        .unwrap();
    assert_eq!(report.restarted, vec![TransportKind::Logo]);
    assert_eq!(orch.transports(), vec![TransportKind::Tcp]);
    assert!(!orch.health().await.logo_online);
    assert!(orch.health().await.primary_online);

    orch.stop().await;
}

#[tokio::test]
async fn test_stop_publishes_no_final_status() {
    let h = Harness::new();
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let orch = DeviceOrchestrator::new(tcp_record("SN-11"), h.ctx.clone());
    orch.start();
    wait_connected(&orch, TransportKind::Tcp).await;
    let statuses = h.statuses.clone();
    assert!(wait_until(WAIT, || !statuses.events().is_empty()).await);

    let published = h.statuses.events().len();
    orch.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.statuses.events().len(), published);
    assert_eq!(orch.connection_state(TransportKind::Tcp), Some(ConnectionState::Disconnected));
    assert!(!orch.is_started());
}

#[tokio::test]
async fn test_incomplete_transport_is_not_built() {
    let h = Harness::new();
    let mut record = tcp_record("SN-12");
    record.connection_config.logo_ip = Some("10.0.0.10".into());

    let orch = DeviceOrchestrator::new(record, h.ctx.clone());
    assert_eq!(orch.transports(), vec![TransportKind::Tcp]);
    assert!(h.factory.built(TransportKind::Logo).is_empty());
}
