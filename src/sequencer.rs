use crate::dispatcher::{CommandHandler, CommandResult};
use crate::subsystems::{CameraControl, LocationControl};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TAKE_PICTURE_COMMAND: &str = "takePicture";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerStats {
    pub invocations: u32,
    pub captures_refused: u32,
}

/// "Take a picture and report my location."
///
/// Issues a capture trigger and then a location publish trigger, in that order, and
/// reports acceptance as soon as both are issued. The publish does not depend on the
/// capture outcome. Nothing is tracked after the triggers go out.
pub struct CapturePublishSequencer<C, L> {
    camera: Arc<C>,
    location: Arc<L>,
    invocations: AtomicU32,
    captures_refused: AtomicU32,
}

impl<C, L> CapturePublishSequencer<C, L>
where
    C: CameraControl + 'static,
    L: LocationControl + 'static,
{
    pub fn new(camera: Arc<C>, location: Arc<L>) -> Self {
        Self {
            camera,
            location,
            invocations: AtomicU32::new(0),
            captures_refused: AtomicU32::new(0),
        }
    }

    /// The argument is accepted and ignored.
    pub fn handle(&self, _argument: &str) -> CommandResult {
        let sequence = self.invocations.fetch_add(1, Ordering::Relaxed) + 1;
        info!(target: "app.cmd", "{} #{}", TAKE_PICTURE_COMMAND, sequence);

        match self.camera.begin_capture() {
            Ok(()) => debug!(target: "app.cmd", "capture triggered"),
            Err(e) => {
                self.captures_refused.fetch_add(1, Ordering::Relaxed);
                warn!(target: "app.cmd", "capture not started: {}", e);
            }
        }

        self.location.request_immediate_publish();
        CommandResult::ACCEPTED
    }

    pub fn into_handler(self: Arc<Self>) -> CommandHandler {
        Arc::new(move |argument: &str| self.handle(argument))
    }

    pub fn get_stats(&self) -> SequencerStats {
        SequencerStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            captures_refused: self.captures_refused.load(Ordering::Relaxed),
        }
    }
}
