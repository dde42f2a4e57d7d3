//! Connectivity stack boundary.
//!
//! [`CloudLink`] is what the core and the subsystems see of the cloud session:
//! initiate a connection, ask whether it is up, publish an event. [`LoopbackCloud`]
//! is an in-process implementation that also plays the remote side, delivering
//! function calls through the registered [`CommandDispatcher`] and buffering
//! published events until someone drains them.

use crate::config::CloudConfig;
use crate::dispatcher::{CommandDispatcher, CommandResult};
use crate::subsystems::lock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const MAX_EVENT_NAME_LEN: usize = 64;
pub const MAX_EVENT_DATA_LEN: usize = 1024;
pub const MAX_PUBLISH_BURST: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("cloud session not connected")]
    NotConnected,
    #[error("connection already initiated")]
    AlreadyConnecting,
    #[error("event data is {0} bytes, limit is {MAX_EVENT_DATA_LEN}")]
    EventTooLarge(usize),
    #[error("invalid event name")]
    InvalidEventName,
}

pub trait CloudLink: Send + Sync {
    /// Initiate the connection. Returns once the handshake has started; inbound
    /// function calls are routed to `functions` from then on.
    fn connect(&self, functions: Arc<CommandDispatcher>) -> Result<(), CloudError>;

    fn is_connected(&self) -> bool;

    /// `WouldBlock` while disconnected or throttled; the caller retries on a later tick.
    fn publish(&self, event: &str, data: &str) -> nb::Result<(), CloudError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub name: String,
    pub data: String,
    pub published_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStats {
    pub published: u32,
    pub throttled: u32,
    pub calls_delivered: u32,
    pub calls_refused: u32,
}

struct LinkState {
    connection: ConnectionState,
    connect_started: Option<Instant>,
    functions: Option<Arc<CommandDispatcher>>,
    outbox: VecDeque<PublishedEvent>,
    publish_times: heapless::Vec<Instant, MAX_PUBLISH_BURST>,
    stats: CloudStats,
}

pub struct LoopbackCloud {
    config: CloudConfig,
    epoch: Instant,
    state: Mutex<LinkState>,
}

impl LoopbackCloud {
    pub fn new(config: CloudConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            state: Mutex::new(LinkState {
                connection: ConnectionState::Disconnected,
                connect_started: None,
                functions: None,
                outbox: VecDeque::new(),
                publish_times: heapless::Vec::new(),
                stats: CloudStats::default(),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        let mut state = lock(&self.state);
        self.refresh_connection(&mut state);
        state.connection
    }

    /// Deliver a remote function call. Runs the handler on the caller's context.
    pub fn call_function(&self, name: &str, argument: &str) -> Result<CommandResult, CloudError> {
        let functions = {
            let mut guard = lock(&self.state);
            self.refresh_connection(&mut guard);
            let state = &mut *guard;
            match (&state.functions, state.connection) {
                (Some(functions), ConnectionState::Connected) => {
                    state.stats.calls_delivered = state.stats.calls_delivered.saturating_add(1);
                    Arc::clone(functions)
                }
                _ => {
                    state.stats.calls_refused = state.stats.calls_refused.saturating_add(1);
                    return Err(CloudError::NotConnected);
                }
            }
        };

        debug!(target: "app.cloud", "function call `{}`", name);
        Ok(functions.invoke(name, argument))
    }

    pub fn drain_published(&self) -> Vec<PublishedEvent> {
        lock(&self.state).outbox.drain(..).collect()
    }

    pub fn get_stats(&self) -> CloudStats {
        lock(&self.state).stats
    }

    fn refresh_connection(&self, state: &mut LinkState) {
        if state.connection != ConnectionState::Connecting {
            return;
        }
        let handshake = Duration::from_millis(self.config.handshake_ms);
        if state.connect_started.is_some_and(|started| started.elapsed() >= handshake) {
            state.connection = ConnectionState::Connected;
            info!(target: "app.cloud", "cloud connected");
        }
    }

    fn throttled(&self, state: &mut LinkState, now: Instant) -> bool {
        let window = Duration::from_millis(self.config.publish_window_ms);
        state
            .publish_times
            .retain(|&published| now.duration_since(published) < window);
        state.publish_times.len() >= usize::from(self.config.publish_burst)
            || state.outbox.len() >= self.config.outbox_capacity
    }
}

impl CloudLink for LoopbackCloud {
    fn connect(&self, functions: Arc<CommandDispatcher>) -> Result<(), CloudError> {
        let mut state = lock(&self.state);
        if state.connection != ConnectionState::Disconnected {
            return Err(CloudError::AlreadyConnecting);
        }
        state.functions = Some(functions);
        state.connection = ConnectionState::Connecting;
        state.connect_started = Some(Instant::now());
        info!(
            target: "app.cloud",
            "connecting (handshake {} ms)",
            self.config.handshake_ms
        );
        self.refresh_connection(&mut state);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn publish(&self, event: &str, data: &str) -> nb::Result<(), CloudError> {
        if event.is_empty() || event.len() > MAX_EVENT_NAME_LEN {
            return Err(nb::Error::Other(CloudError::InvalidEventName));
        }
        if data.len() > MAX_EVENT_DATA_LEN {
            return Err(nb::Error::Other(CloudError::EventTooLarge(data.len())));
        }

        let mut state = lock(&self.state);
        self.refresh_connection(&mut state);
        if state.connection != ConnectionState::Connected {
            return Err(nb::Error::WouldBlock);
        }

        let now = Instant::now();
        if self.throttled(&mut state, now) {
            state.stats.throttled = state.stats.throttled.saturating_add(1);
            trace!(target: "app.cloud", "publish `{}` throttled", event);
            return Err(nb::Error::WouldBlock);
        }

        if state.publish_times.push(now).is_err() {
            // Cannot happen while publish_burst <= MAX_PUBLISH_BURST
            warn!(target: "app.cloud", "publish tracking buffer full");
            return Err(nb::Error::WouldBlock);
        }
        state.outbox.push_back(PublishedEvent {
            name: event.to_string(),
            data: data.to_string(),
            published_at_ms: self.epoch.elapsed().as_millis() as u64,
        });
        state.stats.published = state.stats.published.saturating_add(1);
        trace!(target: "app.cloud", "published `{}` ({} bytes)", event, data.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_config() -> CloudConfig {
        CloudConfig {
            handshake_ms: 0,
            ..CloudConfig::default()
        }
    }

    #[test]
    fn test_publish_blocks_until_connected() {
        let cloud = LoopbackCloud::new(instant_config());
        assert!(!cloud.is_connected());
        assert_eq!(cloud.publish("loc", "{}"), Err(nb::Error::WouldBlock));

        cloud.connect(Arc::new(CommandDispatcher::new())).unwrap();
        assert!(cloud.is_connected());
        assert!(cloud.publish("loc", "{}").is_ok());

        let events = cloud.drain_published();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "loc");
    }

    #[test]
    fn test_handshake_delay() {
        let cloud = LoopbackCloud::new(CloudConfig {
            handshake_ms: 60_000,
            ..CloudConfig::default()
        });
        cloud.connect(Arc::new(CommandDispatcher::new())).unwrap();

        assert_eq!(cloud.connection_state(), ConnectionState::Connecting);
        assert_eq!(cloud.call_function("any", ""), Err(CloudError::NotConnected));
    }

    #[test]
    fn test_connect_twice_rejected() {
        let cloud = LoopbackCloud::new(instant_config());
        cloud.connect(Arc::new(CommandDispatcher::new())).unwrap();
        assert_eq!(
            cloud.connect(Arc::new(CommandDispatcher::new())),
            Err(CloudError::AlreadyConnecting)
        );
    }

    #[test]
    fn test_publish_burst_limit() {
        let cloud = LoopbackCloud::new(CloudConfig {
            handshake_ms: 0,
            publish_burst: 2,
            publish_window_ms: 60_000,
            ..CloudConfig::default()
        });
        cloud.connect(Arc::new(CommandDispatcher::new())).unwrap();

        assert!(cloud.publish("a", "1").is_ok());
        assert!(cloud.publish("a", "2").is_ok());
        assert_eq!(cloud.publish("a", "3"), Err(nb::Error::WouldBlock));
        assert_eq!(cloud.get_stats().throttled, 1);
    }

    #[test]
    fn test_rejects_oversized_event() {
        let cloud = LoopbackCloud::new(instant_config());
        cloud.connect(Arc::new(CommandDispatcher::new())).unwrap();

        let data = "x".repeat(MAX_EVENT_DATA_LEN + 1);
        assert_eq!(
            cloud.publish("big", &data),
            Err(nb::Error::Other(CloudError::EventTooLarge(MAX_EVENT_DATA_LEN + 1)))
        );
        assert_eq!(
            cloud.publish("", "{}"),
            Err(nb::Error::Other(CloudError::InvalidEventName))
        );
    }

    #[test]
    fn test_function_call_routes_through_dispatcher() {
        let dispatcher = Arc::new(CommandDispatcher::new());
        dispatcher
            .register("double", |arg| {
                CommandResult(arg.parse::<i32>().map_or(-2, |value| value * 2))
            })
            .unwrap();

        let cloud = LoopbackCloud::new(instant_config());
        cloud.connect(Arc::clone(&dispatcher)).unwrap();

        assert_eq!(cloud.call_function("double", "21"), Ok(CommandResult(42)));
        assert_eq!(cloud.call_function("missing", ""), Ok(CommandResult::NOT_FOUND));
        assert_eq!(cloud.get_stats().calls_delivered, 2);
    }
}
