use super::{lock, CameraControl, CaptureError, Subsystem, SubsystemError, SubsystemId};
use crate::cloud::CloudLink;
use crate::config::CameraConfig;
use crate::dispatcher::CommandResult;
use crate::upload::{CameraEvent, CameraRequest, TransferProgress, UploadError, UploadSession, CAMERA_EVENT};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// Switched supply feeding the camera accessory.
pub trait PowerRail: Send + Sync {
    fn enable(&self) -> Result<(), SubsystemError>;
    fn is_enabled(&self) -> bool;
}

#[derive(Debug)]
pub struct SimulatedRail {
    present: bool,
    enabled: AtomicBool,
    enable_count: AtomicU32,
}

impl SimulatedRail {
    pub fn new() -> Self {
        Self {
            present: true,
            enabled: AtomicBool::new(false),
            enable_count: AtomicU32::new(0),
        }
    }

    /// A rail with no accessory attached; enabling it fails.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new()
        }
    }

    pub fn enable_count(&self) -> u32 {
        self.enable_count.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedRail {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerRail for SimulatedRail {
    fn enable(&self) -> Result<(), SubsystemError> {
        self.enable_count.fetch_add(1, Ordering::Relaxed);
        if !self.present {
            return Err(SubsystemError::NotPresent("camera accessory"));
        }
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraPhase {
    Unpowered,
    PoweringUp,
    Idle,
    Capturing,
    Uploading { file_num: u32 },
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraState {
    pub phase: CameraPhase,
    pub pending_capture: bool,
    pub captures_started: u32,
    pub captures_rejected: u32,
    pub images_uploaded: u32,
    pub transfers_abandoned: u32,
    pub last_file_num: u32,
}

#[derive(Debug)]
enum Phase {
    Unpowered,
    PoweringUp { ready_at_ms: Option<u64> },
    Idle,
    Capturing { done_at_ms: Option<u64> },
    Uploading(UploadSession),
    Faulted,
}

impl Phase {
    fn public(&self) -> CameraPhase {
        match self {
            Phase::Unpowered => CameraPhase::Unpowered,
            Phase::PoweringUp { .. } => CameraPhase::PoweringUp,
            Phase::Idle => CameraPhase::Idle,
            Phase::Capturing { .. } => CameraPhase::Capturing,
            Phase::Uploading(session) => CameraPhase::Uploading {
                file_num: session.file_num(),
            },
            Phase::Faulted => CameraPhase::Faulted,
        }
    }
}

#[derive(Debug)]
struct CameraInner {
    phase: Phase,
    pending_capture: bool,
    last_tick_ms: u64,
    last_file_num: u32,
    captures_started: u32,
    captures_rejected: u32,
    images_uploaded: u32,
    transfers_abandoned: u32,
}

/// Camera accessory adapter.
///
/// Powers the accessory once during setup, then runs capture and upload as a
/// state machine advanced by [`service_tick`](Subsystem::service_tick). A capture
/// requested while one is in flight is coalesced into a single pending capture.
pub struct CameraAdapter<R, K> {
    config: CameraConfig,
    rail: R,
    cloud: Arc<K>,
    inner: Mutex<CameraInner>,
}

impl<R: PowerRail, K: CloudLink> CameraAdapter<R, K> {
    pub fn new(config: CameraConfig, rail: R, cloud: Arc<K>) -> Self {
        Self {
            config,
            rail,
            cloud,
            inner: Mutex::new(CameraInner {
                phase: Phase::Unpowered,
                pending_capture: false,
                last_tick_ms: 0,
                last_file_num: 0,
                captures_started: 0,
                captures_rejected: 0,
                images_uploaded: 0,
                transfers_abandoned: 0,
            }),
        }
    }

    pub fn rail(&self) -> &R {
        &self.rail
    }

    pub fn get_state(&self) -> CameraState {
        let inner = lock(&self.inner);
        CameraState {
            phase: inner.phase.public(),
            pending_capture: inner.pending_capture,
            captures_started: inner.captures_started,
            captures_rejected: inner.captures_rejected,
            images_uploaded: inner.images_uploaded,
            transfers_abandoned: inner.transfers_abandoned,
            last_file_num: inner.last_file_num,
        }
    }

    /// Handler for the backend's `camera` command (upload acknowledgements).
    pub fn handle_transfer_request(&self, argument: &str) -> CommandResult {
        let request: CameraRequest = match serde_json::from_str(argument) {
            Ok(request) => request,
            Err(e) => {
                warn!(target: "app.cam", "malformed transfer request {:?}: {}", argument, e);
                return CommandResult::MALFORMED_ARGUMENT;
            }
        };
        trace!(target: "app.cam", "transfer request {:?}", request);

        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let Phase::Uploading(session) = &mut inner.phase else {
            debug!(target: "app.cam", "transfer request with no active upload");
            return CommandResult::NOT_READY;
        };

        match session.apply(&request, inner.last_tick_ms) {
            Ok(TransferProgress::Finished) => {
                let file_num = session.file_num();
                inner.phase = Phase::Idle;
                inner.images_uploaded = inner.images_uploaded.saturating_add(1);
                info!(target: "app.cam", "file {} uploaded", file_num);
                CommandResult::ACCEPTED
            }
            Ok(progress) => {
                debug!(target: "app.cam", "file {} {:?}", session.file_num(), progress);
                CommandResult::ACCEPTED
            }
            Err(e @ UploadError::FileMismatch { .. }) => {
                warn!(target: "app.cam", "{}", e);
                CommandResult::NOT_READY
            }
            Err(e) => {
                warn!(target: "app.cam", "{}", e);
                CommandResult::MALFORMED_ARGUMENT
            }
        }
    }

    fn start_capture(&self, inner: &mut CameraInner) {
        inner.pending_capture = false;
        inner.captures_started = inner.captures_started.saturating_add(1);
        inner.phase = Phase::Capturing { done_at_ms: None };
        info!(target: "app.cam", "capture started");
    }

    fn service_upload(&self, inner: &mut CameraInner, now_ms: u64) {
        let Phase::Uploading(session) = &mut inner.phase else {
            return;
        };

        if session.is_finished() {
            inner.phase = Phase::Idle;
            return;
        }
        // Only an unacknowledged start counts against max_start_attempts
        let exhausted = !session.is_start_acked()
            && session.start_attempts() >= self.config.max_start_attempts
            && matches!(session.pending_event(now_ms), Some(CameraEvent::Start { .. }));
        if exhausted || session.is_stalled(now_ms, self.config.transfer_timeout_ms) {
            warn!(target: "app.cam", "abandoning upload of file {}", session.file_num());
            inner.phase = Phase::Idle;
            inner.transfers_abandoned = inner.transfers_abandoned.saturating_add(1);
            return;
        }

        // One event per tick keeps the tick bounded
        let Some(event) = session.pending_event(now_ms) else {
            return;
        };
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                warn!(target: "app.cam", "failed to encode camera event: {}", e);
                return;
            }
        };
        match self.cloud.publish(CAMERA_EVENT, &data) {
            Ok(()) => {
                session.mark_sent(&event, now_ms);
                trace!(target: "app.cam", "sent {:?}", event_label(&data));
            }
            Err(nb::Error::WouldBlock) => {}
            Err(nb::Error::Other(e)) => {
                warn!(target: "app.cam", "camera publish failed: {}", e);
            }
        }
    }
}

fn event_label(data: &str) -> &str {
    data.get(..48).unwrap_or(data)
}

/// Deterministic JPEG-framed test pattern standing in for sensor data.
fn capture_frame(file_num: u32, size: usize) -> Vec<u8> {
    let size = size.max(4);
    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&[0xFF, 0xD8]);
    let mut seed = file_num.wrapping_mul(2_654_435_761).wrapping_add(1);
    while frame.len() < size - 2 {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        frame.push((seed >> 16) as u8);
    }
    frame.extend_from_slice(&[0xFF, 0xD9]);
    frame
}

impl<R: PowerRail, K: CloudLink> Subsystem for CameraAdapter<R, K> {
    fn id(&self) -> SubsystemId {
        SubsystemId::Camera
    }

    fn initialize_once(&self) -> Result<(), SubsystemError> {
        let mut inner = lock(&self.inner);
        if !matches!(inner.phase, Phase::Unpowered) {
            return Err(SubsystemError::AlreadyInitialized(SubsystemId::Camera));
        }

        match self.rail.enable() {
            Ok(()) => {
                inner.phase = Phase::PoweringUp { ready_at_ms: None };
                info!(target: "app.cam", "camera power rail on");
                Ok(())
            }
            Err(e) => {
                inner.phase = Phase::Faulted;
                warn!(target: "app.cam", "camera power-up failed: {}", e);
                Err(e)
            }
        }
    }

    fn service_tick(&self, now_ms: u64) {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        inner.last_tick_ms = now_ms;

        match &mut inner.phase {
            Phase::Unpowered | Phase::Faulted => {}
            Phase::PoweringUp { ready_at_ms } => {
                let ready_at = *ready_at_ms.get_or_insert(now_ms + self.config.power_up_ms);
                if now_ms >= ready_at {
                    inner.phase = Phase::Idle;
                    info!(target: "app.cam", "camera ready");
                }
            }
            Phase::Idle => {
                if inner.pending_capture {
                    self.start_capture(inner);
                }
            }
            Phase::Capturing { done_at_ms } => {
                let done_at = *done_at_ms.get_or_insert(now_ms + self.config.capture_ms);
                if now_ms >= done_at {
                    inner.last_file_num = inner.last_file_num.wrapping_add(1);
                    let file_num = inner.last_file_num;
                    let frame = capture_frame(file_num, self.config.image_size);
                    info!(target: "app.cam", "captured file {} ({} bytes)", file_num, frame.len());
                    inner.phase = Phase::Uploading(UploadSession::new(
                        file_num,
                        frame,
                        self.config.chunk_size,
                        self.config.ack_timeout_ms,
                        now_ms,
                    ));
                }
            }
            Phase::Uploading(_) => self.service_upload(inner, now_ms),
        }
    }
}

impl<R: PowerRail, K: CloudLink> CameraControl for CameraAdapter<R, K> {
    fn begin_capture(&self) -> Result<(), CaptureError> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let result = match inner.phase {
            Phase::Unpowered | Phase::Faulted => Err(CaptureError::Unavailable),
            Phase::PoweringUp { .. } => Err(CaptureError::NotReady),
            Phase::Idle | Phase::Capturing { .. } | Phase::Uploading(_) => {
                if inner.pending_capture {
                    Err(CaptureError::Busy)
                } else {
                    // Picked up by the next service tick in Idle
                    inner.pending_capture = true;
                    Ok(())
                }
            }
        };

        match result {
            Ok(()) => debug!(target: "app.cam", "capture queued"),
            Err(e) => {
                inner.captures_rejected = inner.captures_rejected.saturating_add(1);
                debug!(target: "app.cam", "capture rejected: {}", e);
            }
        }
        result
    }
}
