use super::{lock, LocationControl, Subsystem, SubsystemError, SubsystemId};
use crate::cloud::CloudLink;
use crate::config::LocationConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

pub const LOCATION_EVENT: &str = "loc";

// Simulated drift, roughly walking pace
const DRIFT_DEG_PER_S: f64 = 0.000_01;
const FIX_H_ACC_M: f32 = 3.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GnssFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
    pub h_acc: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishTrigger {
    Immediate,
    Time,
}

#[derive(Serialize)]
struct LocationPayload<'a> {
    time: u64,
    loc: &'a GnssFix,
    trig: [PublishTrigger; 1],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationState {
    pub initialized: bool,
    pub fix: Option<GnssFix>,
    pub publish_count: u32,
    pub last_publish_ms: Option<u64>,
    pub immediate_pending: bool,
    pub deferred_publishes: u32,
}

#[derive(Debug)]
struct LocationInner {
    initialized: bool,
    fix_due_ms: Option<u64>,
    fix: Option<GnssFix>,
    last_fix_update_ms: u64,
    last_publish_ms: Option<u64>,
    publish_count: u32,
    deferred_publishes: u32,
}

/// Location/telemetry subsystem with a simulated GNSS receiver.
///
/// Publishes a `loc` event every `max_publish_interval_s`, or sooner when an
/// immediate publish has been requested and `min_publish_interval_s` has passed.
pub struct LocationTracker<K> {
    config: LocationConfig,
    cloud: Arc<K>,
    immediate: AtomicBool,
    inner: Mutex<LocationInner>,
}

impl<K: CloudLink> LocationTracker<K> {
    pub fn new(config: LocationConfig, cloud: Arc<K>) -> Self {
        Self {
            config,
            cloud,
            immediate: AtomicBool::new(false),
            inner: Mutex::new(LocationInner {
                initialized: false,
                fix_due_ms: None,
                fix: None,
                last_fix_update_ms: 0,
                last_publish_ms: None,
                publish_count: 0,
                deferred_publishes: 0,
            }),
        }
    }

    pub fn get_state(&self) -> LocationState {
        let inner = lock(&self.inner);
        LocationState {
            initialized: inner.initialized,
            fix: inner.fix,
            publish_count: inner.publish_count,
            last_publish_ms: inner.last_publish_ms,
            immediate_pending: self.immediate.load(Ordering::Acquire),
            deferred_publishes: inner.deferred_publishes,
        }
    }

    fn update_fix(&self, inner: &mut LocationInner, now_ms: u64) {
        match inner.fix.as_mut() {
            Some(fix) => {
                let elapsed_s = now_ms.saturating_sub(inner.last_fix_update_ms) as f64 / 1000.0;
                fix.lat += DRIFT_DEG_PER_S * elapsed_s;
                fix.lon += DRIFT_DEG_PER_S * elapsed_s;
            }
            None => {
                let due = *inner.fix_due_ms.get_or_insert(now_ms + self.config.time_to_fix_ms);
                if now_ms < due {
                    return;
                }
                inner.fix = Some(GnssFix {
                    lat: self.config.start_lat,
                    lon: self.config.start_lon,
                    alt: self.config.start_alt,
                    h_acc: FIX_H_ACC_M,
                });
                info!(target: "app.loc", "GNSS fix acquired");
            }
        }
        inner.last_fix_update_ms = now_ms;
    }

    fn publish_trigger(&self, inner: &LocationInner, now_ms: u64) -> Option<PublishTrigger> {
        let since_last = inner.last_publish_ms.map(|last| now_ms.saturating_sub(last));
        let min_ms = u64::from(self.config.min_publish_interval_s) * 1000;
        let max_ms = u64::from(self.config.max_publish_interval_s) * 1000;

        if self.immediate.load(Ordering::Acquire) && since_last.is_none_or(|elapsed| elapsed >= min_ms) {
            return Some(PublishTrigger::Immediate);
        }
        if since_last.is_none_or(|elapsed| elapsed >= max_ms) {
            return Some(PublishTrigger::Time);
        }
        None
    }
}

impl<K: CloudLink> Subsystem for LocationTracker<K> {
    fn id(&self) -> SubsystemId {
        SubsystemId::Location
    }

    fn initialize_once(&self) -> Result<(), SubsystemError> {
        let mut inner = lock(&self.inner);
        if inner.initialized {
            return Err(SubsystemError::AlreadyInitialized(SubsystemId::Location));
        }
        inner.initialized = true;
        info!(
            target: "app.loc",
            "location ready (publish every {}..{} s)",
            self.config.min_publish_interval_s, self.config.max_publish_interval_s
        );
        Ok(())
    }

    fn service_tick(&self, now_ms: u64) {
        let mut inner = lock(&self.inner);
        if !inner.initialized {
            return;
        }

        self.update_fix(&mut inner, now_ms);
        let Some(fix) = inner.fix else {
            return;
        };
        let Some(trigger) = self.publish_trigger(&inner, now_ms) else {
            return;
        };

        let payload = LocationPayload {
            time: now_ms / 1000,
            loc: &fix,
            trig: [trigger],
        };
        let data = match serde_json::to_string(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(target: "app.loc", "failed to encode location: {}", e);
                return;
            }
        };

        match self.cloud.publish(LOCATION_EVENT, &data) {
            Ok(()) => {
                // A request arriving during a time-triggered publish stays pending
                if trigger == PublishTrigger::Immediate {
                    self.immediate.store(false, Ordering::Release);
                }
                inner.last_publish_ms = Some(now_ms);
                inner.publish_count = inner.publish_count.saturating_add(1);
                debug!(target: "app.loc", "published location ({:?}) {}", trigger, data);
            }
            Err(nb::Error::WouldBlock) => {
                inner.deferred_publishes = inner.deferred_publishes.saturating_add(1);
                trace!(target: "app.loc", "location publish deferred");
            }
            Err(nb::Error::Other(e)) => {
                warn!(target: "app.loc", "location publish failed: {}", e);
            }
        }
    }
}

impl<K: CloudLink> LocationControl for LocationTracker<K> {
    fn request_immediate_publish(&self) {
        self.immediate.store(true, Ordering::Release);
        debug!(target: "app.loc", "immediate location publish requested");
    }
}
