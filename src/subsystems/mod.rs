pub mod camera;
pub mod location;

pub use camera::{CameraAdapter, CameraPhase, CameraState, PowerRail, SimulatedRail};
pub use location::{LocationState, LocationTracker};

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsystemId {
    Location,
    Camera,
}

impl SubsystemId {
    /// Log category used by the subsystem.
    pub fn log_target(self) -> &'static str {
        match self {
            SubsystemId::Location => "app.loc",
            SubsystemId::Camera => "app.cam",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubsystemError {
    #[error("{0:?} already initialized")]
    AlreadyInitialized(SubsystemId),
    #[error("power rail fault: {0}")]
    PowerRail(&'static str),
    #[error("hardware not present: {0}")]
    NotPresent(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera is still powering up")]
    NotReady,
    #[error("camera is unavailable")]
    Unavailable,
    #[error("a capture is already pending")]
    Busy,
}

/// A component with a one-time setup step and an incremental service step.
///
/// Both methods take `&self`: remote command handlers reach the same instance from the
/// connectivity context while the tick loop services it, so implementations keep their
/// mutable state behind their own lock.
pub trait Subsystem: Send + Sync {
    fn id(&self) -> SubsystemId;

    fn initialize_once(&self) -> Result<(), SubsystemError>;

    /// Advance the internal state machine by a bounded amount of work. Never blocks.
    fn service_tick(&self, now_ms: u64);
}

pub trait CameraControl: Subsystem {
    /// Start a capture. Returns immediately; the capture and its upload progress
    /// inside later `service_tick` calls.
    fn begin_capture(&self) -> Result<(), CaptureError>;
}

pub trait LocationControl: Subsystem {
    /// Schedule an out-of-cycle location publish on a later `service_tick`.
    fn request_immediate_publish(&self);
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
