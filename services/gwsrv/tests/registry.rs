//! GatewayRegistry: roster reloads and inbound command routing

mod common;

use std::time::Duration;

use serde_json::json;

use crate::common::{tcp_logo_record, tcp_record, wait_until, Harness};
use gwsrv::bus::{CommandAction, CommandEnvelope};
use gwsrv::core::command::{DeviceCommand, WriteOp};
use gwsrv::core::transport::TransportKind;
use gwsrv::runtime::{CommandOutcome, ConnectionState, DeviceRef, GatewayRegistry};
use gwsrv::GwSrvError;

const WAIT: Duration = Duration::from_secs(2);

async fn all_connected(registry: &GatewayRegistry, serial: &str) -> bool {
    let Some(orch) = registry.get(serial).await else {
        return false;
    };
    let transports = orch.transports();
    wait_until(WAIT, || {
        transports
            .iter()
            .all(|kind| orch.connection_state(*kind) == Some(ConnectionState::Connected))
    })
    .await
}

#[tokio::test]
async fn test_reload_builds_and_lists_devices() {
    let h = Harness::new();
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let registry = GatewayRegistry::new(h.ctx.clone());

    registry
        .reload(vec![tcp_record("SN-B"), tcp_record("SN-A"), tcp_record("SN-B")])
        .await;

    assert_eq!(registry.len().await, 2);
    let devices = registry.devices().await;
    let serials: Vec<&str> = devices.iter().map(DeviceRef::serial).collect();
    assert_eq!(serials, vec!["SN-A", "SN-B"]);
    assert!(devices.iter().all(DeviceRef::is_live));
    assert!(all_connected(&registry, "SN-A").await);

    registry.shutdown().await;
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_reload_stops_previous_set_first() {
    let h = Harness::new();
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let registry = GatewayRegistry::new(h.ctx.clone());
    registry.reload(vec![tcp_record("SN-1")]).await;
    assert!(all_connected(&registry, "SN-1").await);
    let old = registry.get("SN-1").await.unwrap();

    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    registry.reload(vec![tcp_record("SN-1")]).await;

    assert!(!old.is_started());
    assert_eq!(old.connection_state(TransportKind::Tcp), Some(ConnectionState::Disconnected));
    let new = registry.get("SN-1").await.unwrap();
    assert!(new.is_started());
    assert!(!std::sync::Arc::ptr_eq(&old, &new));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_update_status_routes_to_device() {
    let h = Harness::new();
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let logo = h.healthy_mock(TransportKind::Logo, "10.0.0.10:502");
    let registry = GatewayRegistry::new(h.ctx.clone());
    registry.reload(vec![tcp_logo_record("SN-1")]).await;
    assert!(all_connected(&registry, "SN-1").await);

    let envelope = CommandEnvelope::new("SN-1", CommandAction::UpdateStatus, json!({"value": "on"}));
    let outcome = registry.dispatch(&envelope).await.unwrap();
    assert_eq!(
        outcome,
        CommandOutcome::Executed {
            command: DeviceCommand::TurnOn,
            transport: TransportKind::Logo,
        }
    );
    assert_eq!(logo.writes(), vec![WriteOp::Coil { address: 3, value: true }]);

    // numeric codes from older clients
    let envelope = CommandEnvelope::new("SN-1", CommandAction::UpdateStatus, json!({"value": 2}));
    assert!(matches!(
        registry.dispatch(&envelope).await.unwrap(),
        CommandOutcome::Executed {
            command: DeviceCommand::Restart,
            ..
        }
    ));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_errors() {
    let h = Harness::new();
    let registry = GatewayRegistry::new(h.ctx.clone());
    registry.reload(vec![tcp_record("SN-1")]).await;

    let unknown = CommandEnvelope::new("SN-X", CommandAction::UpdateStatus, json!({"value": "on"}));
    assert!(matches!(
        registry.dispatch(&unknown).await.unwrap_err(),
        GwSrvError::DeviceError(_)
    ));

    let bad_value = CommandEnvelope::new("SN-1", CommandAction::UpdateStatus, json!({"value": "explode"}));
    assert!(matches!(
        registry.dispatch(&bad_value).await.unwrap_err(),
        GwSrvError::ValidationError(_)
    ));

    let missing = CommandEnvelope::new("SN-1", CommandAction::UpdateStatus, json!({}));
    assert!(registry.dispatch(&missing).await.is_err());

    let not_object = CommandEnvelope::new("SN-1", CommandAction::UpdateConnections, json!("host"));
    assert!(matches!(
        registry.dispatch(&not_object).await.unwrap_err(),
        GwSrvError::ValidationError(_)
    ));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_update_config_renames_and_reconfigures() {
    let h = Harness::new();
    h.healthy_mock(TransportKind::Tcp, "10.0.0.5:502");
    let registry = GatewayRegistry::new(h.ctx.clone());
    registry.reload(vec![tcp_record("SN-1")]).await;
    assert!(all_connected(&registry, "SN-1").await);

    h.healthy_mock(TransportKind::Logo, "10.0.0.10:502");
    let envelope = CommandEnvelope::new(
        "SN-1",
        CommandAction::UpdateConfig,
        json!({
            "name": "Booster 1",
            "connectionConfig": {"logoIp": "10.0.0.10", "logoPort": "502"},
        }),
    );
    let outcome = registry.dispatch(&envelope).await.unwrap();
    match outcome {
        CommandOutcome::Reconfigured(report) => {
            assert_eq!(report.restarted, vec![TransportKind::Logo]);
        },
        other => panic!("unexpected {:?}", other),
    }

    let orch = registry.get("SN-1").await.unwrap();
    assert_eq!(orch.name(), "Booster 1");
    assert_eq!(orch.connection_config().logo_port, Some(502));
    assert_eq!(orch.transports(), vec![TransportKind::Tcp, TransportKind::Logo]);

    let rename_only = CommandEnvelope::new("SN-1", CommandAction::UpdateConfig, json!({"name": "B1"}));
    match registry.dispatch(&rename_only).await.unwrap() {
        CommandOutcome::Reconfigured(report) => assert!(report.is_noop()),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(orch.name(), "B1");

    registry.shutdown().await;
}
