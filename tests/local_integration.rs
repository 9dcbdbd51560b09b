//! Module-to-module tests over the in-process network.

use obsbus::comm::{Comm, LocalNetwork};
use obsbus::dispatch::{arg, ExclusiveLock};
use obsbus::events::{
    BadWeatherEvent, GoodWeatherEvent, ModuleStateChangedEvent, MoveAltAzEvent, NewImageEvent,
    RoofOpenedEvent, ROOT_EVENT,
};
use obsbus::proxy::{CameraProxy, ModuleProxy};
use obsbus::{Error, ErrorKind, Identity, Module, ModuleContext, ModuleState, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// =============================================================================
// Test Helpers
// =============================================================================

fn id(name: &str) -> Identity {
    Identity::parse(name).unwrap()
}

fn module_on(network: &Arc<LocalNetwork>, name: &str) -> obsbus::module::ModuleBuilder {
    let comm: Arc<dyn Comm> = Arc::new(network.comm(id(name)));
    Module::builder(comm)
}

struct Camera {
    exposures: AtomicUsize,
    failing: AtomicBool,
    shutter: ExclusiveLock,
}

async fn expose(camera: Arc<Camera>, ctx: Arc<ModuleContext>, args: Vec<Value>) -> Result<Value> {
    let _shutter = camera.shutter.acquire()?;
    let broadcast: Option<bool> = arg(&args, 0)?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    if camera.failing.load(Ordering::SeqCst) {
        return Err(Error::image("readout failed"));
    }
    let n = camera.exposures.fetch_add(1, Ordering::SeqCst) + 1;
    let filename = format!("/data/img_{:04}.fits", n);
    if broadcast.unwrap_or(true) {
        ctx.publish(&NewImageEvent {
            filename: filename.clone(),
            image_type: Some("object".into()),
        })
        .await?;
    }
    Ok(json!(filename))
}

fn camera_module(network: &Arc<LocalNetwork>) -> (Module, Arc<Camera>) {
    let camera = Arc::new(Camera {
        exposures: AtomicUsize::new(0),
        failing: AtomicBool::new(false),
        shutter: ExclusiveLock::new("shutter"),
    });
    let state = camera.clone();
    let module = module_on(network, "camera")
        .label("Main camera")
        .implements("ICamera")
        .bind("expose", move |ctx, args| expose(state.clone(), ctx, args))
        .bind("abort", |_, _| async { Ok(Value::Null) })
        .bind("get_exposure_status", |_, _| async { Ok(json!("IDLE")) })
        .bind("get_exposure_progress", |_, _| async { Ok(json!(0.0)) })
        .build()
        .unwrap();
    (module, camera)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Calls
// =============================================================================

#[tokio::test]
async fn test_expose_through_proxy_broadcasts_image() {
    let network = LocalNetwork::new();
    let (camera, _) = camera_module(&network);
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    assert_ok!(camera.open().await);
    assert_ok!(scheduler.open().await);

    let images = scheduler.subscribe("NewImageEvent").await;
    let proxy: CameraProxy = scheduler.proxy(&id("camera")).await.unwrap();
    let filename = proxy.expose(Some(true)).await.unwrap();
    assert_eq!(filename, "/data/img_0001.fits");

    let (event, image) = images
        .recv_payload::<NewImageEvent>()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.origin, id("camera"));
    assert_eq!(image.filename, filename);

    let label: ModuleProxy = scheduler.proxy(&id("camera")).await.unwrap();
    assert_eq!(label.get_label().await.unwrap(), "Main camera");

    assert_ok!(scheduler.close().await);
    assert_ok!(camera.close().await);
}

#[tokio::test]
async fn test_exposure_not_supported_by_camera_only_peer() {
    let network = LocalNetwork::new();
    let (camera, _) = camera_module(&network);
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    camera.open().await.unwrap();
    scheduler.open().await.unwrap();

    let err = assert_err!(scheduler.proxy_for(&id("camera"), "IExposureTime").await);
    assert_eq!(err.kind(), ErrorKind::InterfaceNotSupported);

    assert_eq!(
        scheduler
            .registry()
            .clients_with_interface("ICamera")
            .await
            .unwrap(),
        vec![id("camera")]
    );
}

#[tokio::test]
async fn test_concurrent_exposures_fail_fast() {
    let network = LocalNetwork::new();
    let (camera, _) = camera_module(&network);
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    camera.open().await.unwrap();
    scheduler.open().await.unwrap();

    let proxy: CameraProxy = scheduler.proxy(&id("camera")).await.unwrap();
    let (a, b) = tokio::join!(proxy.expose(Some(false)), proxy.expose(Some(false)));
    let (ok, busy) = if a.is_ok() { (a, b) } else { (b, a) };
    assert!(ok.is_ok());
    match busy.unwrap_err() {
        Error::Remote { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::Busy);
            assert!(message.contains("shutter is busy"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_repeated_contention_does_not_escalate() {
    let network = LocalNetwork::new();
    let (camera, _) = camera_module(&network);
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    camera.open().await.unwrap();
    scheduler.open().await.unwrap();

    let proxy: CameraProxy = scheduler.proxy(&id("camera")).await.unwrap();
    let mut rejected = 0;
    for _ in 0..5 {
        let (a, b) = tokio::join!(proxy.expose(Some(false)), proxy.expose(Some(false)));
        rejected += [a, b].iter().filter(|r| r.is_err()).count();
    }
    assert_eq!(rejected, 5);

    assert_eq!(camera.state().await, ModuleState::Ok);
    assert_eq!(camera.error_string().await, "");
    assert_ok!(proxy.expose(Some(false)).await);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_elapses_but_handler_finishes() {
    let network = LocalNetwork::new();
    let focus = Arc::new(std::sync::Mutex::new(0.0f64));
    let position = focus.clone();
    let focuser = module_on(&network, "focuser")
        .implements("IFocuser")
        .bind("set_focus", move |_, args| {
            let position = position.clone();
            async move {
                let target: f64 = arg(&args, 0)?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                *position.lock().unwrap_or_else(|e| e.into_inner()) = target;
                Ok(Value::Null)
            }
        })
        .bind("get_focus", |_, _| async { Ok(json!(0.0)) })
        .bind("abort", |_, _| async { Ok(Value::Null) })
        .build()
        .unwrap();
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    focuser.open().await.unwrap();
    scheduler.open().await.unwrap();

    let proxy = scheduler.proxy_for(&id("focuser"), "IFocuser").await.unwrap();
    let err = proxy
        .call("set_focus", vec![json!(12.5)], Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteTimeout);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(*focus.lock().unwrap(), 12.5);
    assert_eq!(focuser.state().await, ModuleState::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_outstanding_calls() {
    let network = LocalNetwork::new();
    let roof = module_on(&network, "roof")
        .implements("IRoof")
        .bind("open_roof", |_, _| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Value::Null)
        })
        .bind("close_roof", |_, _| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Value::Null)
        })
        .bind("get_motion_status", |_, _| async { Ok(json!("IDLE")) })
        .bind("abort", |_, _| async { Ok(Value::Null) })
        .build()
        .unwrap();
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    roof.open().await.unwrap();
    scheduler.open().await.unwrap();

    let proxy = scheduler.proxy_for(&id("roof"), "IRoof").await.unwrap();
    assert_eq!(scheduler.registry().cached().await, vec![id("roof")]);

    let first = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.call("open_roof", vec![], None).await }
    });
    let second = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.call("close_roof", vec![], None).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    scheduler.comm().disconnect().await.unwrap();

    for call in [first, second] {
        match call.await.unwrap().unwrap_err() {
            Error::Remote { message, .. } => assert_eq!(message, "connection lost"),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(scheduler.registry().cached().await.is_empty());
}

// =============================================================================
// Fault escalation across modules
// =============================================================================

#[tokio::test]
async fn test_repeated_image_errors_make_camera_severe() {
    let network = LocalNetwork::new();
    let (camera, state) = camera_module(&network);
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    camera.open().await.unwrap();
    scheduler.open().await.unwrap();

    let changes = scheduler.subscribe("ModuleStateChangedEvent").await;
    let proxy: CameraProxy = scheduler.proxy(&id("camera")).await.unwrap();
    state.failing.store(true, Ordering::SeqCst);

    for _ in 0..3 {
        match proxy.expose(Some(false)).await.unwrap_err() {
            Error::Remote { kind, .. } => assert_eq!(kind, ErrorKind::Image),
            other => panic!("unexpected {other:?}"),
        }
    }
    match proxy.expose(Some(false)).await.unwrap_err() {
        Error::Remote { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::Module);
            assert!(message.contains("severe error state"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut transitions = Vec::new();
    while transitions.len() < 2 {
        let (_, change) = changes
            .recv_payload::<ModuleStateChangedEvent>()
            .await
            .unwrap()
            .unwrap();
        transitions.push((change.old, change.new, change.kind));
    }
    assert_eq!(
        transitions,
        vec![
            (ModuleState::Ok, ModuleState::Error, Some(ErrorKind::Image)),
            (ModuleState::Error, ModuleState::SevereError, Some(ErrorKind::Image)),
        ]
    );

    let health: ModuleProxy = scheduler.proxy(&id("camera")).await.unwrap();
    assert_eq!(health.get_state().await.unwrap(), ModuleState::SevereError);
    assert_eq!(health.get_error_string().await.unwrap(), "readout failed");
    assert!(health.reset_error().await.unwrap());
    assert_eq!(health.get_state().await.unwrap(), ModuleState::Ok);

    state.failing.store(false, Ordering::SeqCst);
    assert_ok!(proxy.expose(Some(false)).await);
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn test_base_type_subscription_sees_only_later_descendants() {
    let network = LocalNetwork::new();
    let weather = module_on(&network, "weather").build().unwrap();
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    weather.open().await.unwrap();
    scheduler.open().await.unwrap();

    let everything = scheduler.subscribe(ROOT_EVENT).await;
    weather.publish(&BadWeatherEvent {}).await.unwrap();
    loop {
        let event = everything.recv().await.unwrap();
        if event.is::<BadWeatherEvent>() {
            break;
        }
    }

    let weather_events = scheduler.subscribe("WeatherEvent").await;
    weather.publish(&GoodWeatherEvent::default()).await.unwrap();
    weather.publish(&RoofOpenedEvent {}).await.unwrap();
    weather.publish(&BadWeatherEvent {}).await.unwrap();

    let first = weather_events.recv().await.unwrap();
    let second = weather_events.recv().await.unwrap();
    assert_eq!(first.event_type, "GoodWeatherEvent");
    assert_eq!(second.event_type, "BadWeatherEvent");
    assert!(weather_events.try_recv().is_none());
}

#[tokio::test]
async fn test_events_arrive_in_publish_order() {
    let network = LocalNetwork::new();
    let telescope = module_on(&network, "telescope").build().unwrap();
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    telescope.open().await.unwrap();
    scheduler.open().await.unwrap();

    let moves = scheduler.subscribe("MoveEvent").await;
    for i in 0..50 {
        telescope
            .publish(&MoveAltAzEvent {
                alt: 30.0,
                az: f64::from(i),
            })
            .await
            .unwrap();
    }
    for i in 0..50 {
        let (_, event) = moves.recv_payload::<MoveAltAzEvent>().await.unwrap().unwrap();
        assert_eq!(event.az, f64::from(i));
    }
    assert_eq!(moves.dropped(), 0);
}

#[tokio::test]
async fn test_peer_close_invalidates_cache() {
    let network = LocalNetwork::new();
    let (camera, _) = camera_module(&network);
    let scheduler = module_on(&network, "scheduler").build().unwrap();
    camera.open().await.unwrap();
    scheduler.open().await.unwrap();

    scheduler.proxy::<CameraProxy>(&id("camera")).await.unwrap();
    assert_eq!(scheduler.registry().cached().await, vec![id("camera")]);

    camera.close().await.unwrap();
    let registry = scheduler.registry();
    eventually(move || async move { registry.cached().await.is_empty() }).await;

    let err = scheduler.proxy::<CameraProxy>(&id("camera")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
}
