use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use trackcam::cloud::{CloudLink, ConnectionState, LoopbackCloud};
use trackcam::config::{BackendConfig, CameraConfig, CloudConfig, LocationConfig, OrchestratorConfig};
use trackcam::sequencer::TAKE_PICTURE_COMMAND;
use trackcam::subsystems::location::LOCATION_EVENT;
use trackcam::subsystems::{CameraAdapter, CameraPhase, LocationTracker, SimulatedRail};
use trackcam::upload::{CallRetryQueue, CameraRequest, CompletedImage, ImageAssembler, CAMERA_COMMAND, CAMERA_EVENT};
use trackcam::{CommandResult, InitializationState, Orchestrator};

type Camera = CameraAdapter<SimulatedRail, LoopbackCloud>;
type Device = Orchestrator<LocationTracker<LoopbackCloud>, Camera, LoopbackCloud>;

fn build_device(rail: SimulatedRail) -> (Device, Arc<Camera>, Arc<LoopbackCloud>) {
    let cloud = Arc::new(LoopbackCloud::new(CloudConfig {
        handshake_ms: 0,
        publish_burst: 16,
        publish_window_ms: 1,
        outbox_capacity: 1024,
    }));
    let location = Arc::new(LocationTracker::new(
        LocationConfig {
            min_publish_interval_s: 0,
            time_to_fix_ms: 0,
            ..LocationConfig::default()
        },
        Arc::clone(&cloud),
    ));
    let camera = Arc::new(CameraAdapter::new(
        CameraConfig {
            power_up_ms: 5,
            capture_ms: 5,
            image_size: 600,
            chunk_size: 256,
            ack_timeout_ms: 1_000,
            max_start_attempts: 5,
            transfer_timeout_ms: 10_000,
        },
        rail,
        Arc::clone(&cloud),
    ));

    let transfer_camera = Arc::clone(&camera);
    let orchestrator = Orchestrator::new(
        location,
        Arc::clone(&camera),
        Arc::clone(&cloud),
        OrchestratorConfig::default(),
    )
    .with_command(CAMERA_COMMAND, move |argument| transfer_camera.handle_transfer_request(argument));

    (orchestrator, camera, cloud)
}

/// Feed published events to the backend and deliver its answers to the device.
fn pump_backend(cloud: &LoopbackCloud, assembler: &mut ImageAssembler, now_ms: u64) -> Option<CompletedImage> {
    let mut completed = None;
    for event in cloud.drain_published() {
        match event.name.as_str() {
            LOCATION_EVENT => assembler.on_location(&event.data).unwrap(),
            CAMERA_EVENT => {
                let outcome = assembler.on_camera_data(&event.data, now_ms).unwrap();
                for request in &outcome.requests {
                    let argument = serde_json::to_string(request).unwrap();
                    assert_eq!(
                        cloud.call_function(CAMERA_COMMAND, &argument),
                        Ok(CommandResult::ACCEPTED)
                    );
                }
                completed = completed.or(outcome.completed);
            }
            _ => {}
        }
    }
    completed
}

fn tick_until(device: &mut Device, deadline: Duration, mut done: impl FnMut(&mut Device) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        device.tick();
        if done(device) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_take_picture_uploads_image_with_location() {
    let (mut device, camera, cloud) = build_device(SimulatedRail::new());
    let report = device.initialize().unwrap();
    assert!(!report.is_degraded());
    assert_eq!(cloud.connection_state(), ConnectionState::Connected);

    assert!(tick_until(&mut device, Duration::from_secs(2), |_| {
        camera.get_state().phase == CameraPhase::Idle
    }));

    let mut assembler = ImageAssembler::new(BackendConfig::default());
    let epoch = Instant::now();
    pump_backend(&cloud, &mut assembler, 0);

    assert_eq!(
        cloud.call_function(TAKE_PICTURE_COMMAND, ""),
        Ok(CommandResult::ACCEPTED)
    );

    let mut image = None;
    let finished = tick_until(&mut device, Duration::from_secs(5), |_| {
        let now_ms = epoch.elapsed().as_millis() as u64;
        if let Some(completed) = pump_backend(&cloud, &mut assembler, now_ms) {
            image = Some(completed);
        }
        camera.get_state().images_uploaded == 1
    });
    assert!(finished, "upload did not finish: {:?}", camera.get_state());

    let image = image.unwrap();
    assert_eq!(image.file_num, 1);
    assert_eq!(image.file_name, "00001.jpg");
    assert_eq!(image.data.len(), 600);
    assert_eq!(&image.data[..2], &[0xFF, 0xD8]);

    let location = image.location.unwrap();
    assert_eq!(location["trig"][0], "immediate");
    assert!(location["loc"]["lat"].is_number());

    assert_eq!(camera.get_state().phase, CameraPhase::Idle);
    assert_eq!(device.sequencer_stats().unwrap().invocations, 1);
}

#[test]
fn test_missing_camera_still_reports_location() {
    let (mut device, camera, cloud) = build_device(SimulatedRail::absent());
    let report = device.initialize().unwrap().clone();

    assert!(report.is_degraded());
    assert!(report.cloud.is_completed());
    assert_eq!(device.state(), InitializationState::Ready);
    assert_eq!(camera.get_state().phase, CameraPhase::Faulted);

    // Let the first periodic publish go out, then ask for an immediate one
    device.tick();
    cloud.drain_published();

    assert_eq!(
        cloud.call_function(TAKE_PICTURE_COMMAND, ""),
        Ok(CommandResult::ACCEPTED)
    );
    device.tick();

    let events = cloud.drain_published();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, LOCATION_EVENT);
    let payload: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
    assert_eq!(payload["trig"][0], "immediate");

    let stats = device.sequencer_stats().unwrap();
    assert_eq!(stats.captures_refused, 1);
    assert_eq!(camera.get_state().captures_rejected, 1);
}

#[test]
fn test_calls_refused_before_connect() {
    let (mut device, _camera, cloud) = build_device(SimulatedRail::new());
    assert!(!cloud.is_connected());
    assert!(cloud.call_function(TAKE_PICTURE_COMMAND, "").is_err());

    device.initialize().unwrap();
    assert_eq!(cloud.call_function("unknown", ""), Ok(CommandResult::NOT_FOUND));
    assert_eq!(cloud.get_stats().calls_refused, 1);
}

#[test]
fn test_undelivered_camera_call_retried_after_connect() {
    let (mut device, _camera, cloud) = build_device(SimulatedRail::new());
    let mut retries = CallRetryQueue::new(BackendConfig::default().call_retry_ms);
    let request = CameraRequest::Done { file: 1 };
    let argument = serde_json::to_string(&request).unwrap();

    assert!(cloud.call_function(CAMERA_COMMAND, &argument).is_err());
    retries.defer(request.clone(), 0);

    device.initialize().unwrap();
    assert!(retries.take_due(19_999).is_empty());

    let due = retries.take_due(20_000);
    assert_eq!(due, vec![request]);
    let argument = serde_json::to_string(&due[0]).unwrap();
    // Delivered this time; no upload is active so the camera refuses it
    assert_eq!(
        cloud.call_function(CAMERA_COMMAND, &argument),
        Ok(CommandResult::NOT_READY)
    );
    assert!(retries.is_empty());
}
