//! Modules talking through a real hub over TCP.

use obsbus::comm::{Comm, Hub, TcpComm};
use obsbus::events::{FocusFoundEvent, ModuleClosedEvent};
use obsbus::proxy::ModuleProxy;
use obsbus::{ErrorKind, Identity, Module, ModuleConfig, ModuleState, TransportConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Helpers
// =============================================================================

fn id(name: &str) -> Identity {
    Identity::parse(name).unwrap()
}

async fn start_hub() -> (Arc<Hub>, SocketAddr, CancellationToken) {
    let hub = Arc::new(
        Hub::bind("127.0.0.1:0".parse().unwrap(), TransportConfig::default())
            .await
            .unwrap(),
    );
    let addr = hub.local_addr().unwrap();
    let token = hub.shutdown_token();
    let server = hub.clone();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    (hub, addr, token)
}

fn transport(name: &str, addr: SocketAddr) -> Arc<dyn Comm> {
    Arc::new(TcpComm::new(
        id(name),
        TransportConfig {
            hub_addr: addr.to_string(),
            ..TransportConfig::default()
        },
    ))
}

fn focuser(addr: SocketAddr, version: &str) -> Module {
    let config = ModuleConfig {
        version: version.to_string(),
        ..ModuleConfig::default()
    };
    Module::builder(transport("focuser", addr))
        .config(config)
        .implements("IFocuser")
        .implements("IAutoFocus")
        .bind("set_focus", |_, _| async { Ok(Value::Null) })
        .bind("get_focus", |_, _| async { Ok(json!(42.0)) })
        .bind("abort", |_, _| async { Ok(Value::Null) })
        .bind("auto_focus", |ctx, _| async move {
            ctx.publish(&FocusFoundEvent {
                focus: 41.5,
                error: 0.2,
                filter: Some("R".into()),
            })
            .await?;
            Ok(json!([41.5, 0.2]))
        })
        .bind("auto_focus_status", |_, _| async { Ok(json!({"running": false})) })
        .build()
        .unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_call_and_event_through_hub() {
    let (_hub, addr, token) = start_hub().await;
    let focuser = focuser(addr, "0.1.0");
    let scheduler = Module::builder(transport("scheduler", addr)).build().unwrap();
    focuser.open().await.unwrap();
    scheduler.open().await.unwrap();

    let found = scheduler.subscribe("FocusFoundEvent").await;
    let proxy = scheduler.proxy_for(&id("focuser"), "IAutoFocus").await.unwrap();
    let result = proxy
        .call("auto_focus", vec![json!(5), json!(10.0), json!(2.0)], None)
        .await
        .unwrap();
    assert_eq!(result, json!([41.5, 0.2]));

    let (event, payload) = found
        .recv_payload::<FocusFoundEvent>()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.origin, id("focuser"));
    assert_eq!(payload.filter.as_deref(), Some("R"));

    let focus: f64 = scheduler
        .proxy_for(&id("focuser"), "IFocuser")
        .await
        .unwrap()
        .call_as("get_focus", vec![], None)
        .await
        .unwrap();
    assert_eq!(focus, 42.0);

    scheduler.close().await.unwrap();
    focuser.close().await.unwrap();
    token.cancel();
}

#[tokio::test]
async fn test_discovery_through_hub() {
    let (hub, addr, token) = start_hub().await;
    let focuser = focuser(addr, "0.1.0");
    let scheduler = Module::builder(transport("scheduler", addr)).build().unwrap();
    focuser.open().await.unwrap();
    scheduler.open().await.unwrap();

    let mut connected = hub.connected().await;
    connected.sort();
    assert_eq!(connected, vec![id("focuser"), id("scheduler")]);

    let registry = scheduler.registry();
    assert_eq!(
        registry.clients_with_interface("IAbortable").await.unwrap(),
        vec![id("focuser")]
    );
    assert!(registry.clients_with_interface("IRoof").await.unwrap().is_empty());

    let err = registry
        .create_proxy(&id("focuser"), "ICamera")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InterfaceNotSupported);

    let health: ModuleProxy = scheduler.proxy(&id("focuser")).await.unwrap();
    assert_eq!(health.get_state().await.unwrap(), ModuleState::Ok);
    assert_eq!(health.get_version().await.unwrap(), "0.1.0");

    token.cancel();
}

#[tokio::test]
async fn test_duplicate_identity_rejected() {
    let (_hub, addr, token) = start_hub().await;
    let first = focuser(addr, "0.1.0");
    first.open().await.unwrap();

    let second = focuser(addr, "0.1.0");
    let err = second.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    first.close().await.unwrap();
    token.cancel();
}

#[tokio::test]
async fn test_unknown_target_is_rejected() {
    let (_hub, addr, token) = start_hub().await;
    let scheduler = Module::builder(transport("scheduler", addr)).build().unwrap();
    scheduler.open().await.unwrap();

    let err = scheduler
        .proxy_for(&id("nobody"), "IModule")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);

    token.cancel();
}

#[tokio::test]
async fn test_closed_peer_announces_and_leaves() {
    let (hub, addr, token) = start_hub().await;
    let focuser = focuser(addr, "0.1.0");
    let scheduler = Module::builder(transport("scheduler", addr)).build().unwrap();
    focuser.open().await.unwrap();
    scheduler.open().await.unwrap();

    scheduler.proxy::<ModuleProxy>(&id("focuser")).await.unwrap();
    assert_eq!(scheduler.registry().cached().await, vec![id("focuser")]);

    let closed = scheduler.subscribe("ModuleClosedEvent").await;
    focuser.close().await.unwrap();

    let (event, _) = closed
        .recv_payload::<ModuleClosedEvent>()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.origin, id("focuser"));

    for _ in 0..100 {
        if hub.connected().await == vec![id("scheduler")] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.connected().await, vec![id("scheduler")]);
    assert!(scheduler.registry().cached().await.is_empty());

    scheduler.close().await.unwrap();
    token.cancel();
}
