use crate::cloud::{CloudError, CloudLink};
use crate::config::OrchestratorConfig;
use crate::dispatcher::{CommandDispatcher, CommandHandler, CommandResult, DispatchError};
use crate::sequencer::{CapturePublishSequencer, SequencerStats, TAKE_PICTURE_COMMAND};
use crate::subsystems::{CameraControl, LocationControl, SubsystemError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InitializationState {
    Uninitialized,
    SubsystemsStarting,
    CloudConnecting,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Completed,
    Failed(String),
}

impl StepOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed)
    }
}

impl From<Result<(), SubsystemError>> for StepOutcome {
    fn from(result: Result<(), SubsystemError>) -> Self {
        result.map_or_else(|e| StepOutcome::Failed(e.to_string()), |()| StepOutcome::Completed)
    }
}

impl From<Result<(), CloudError>> for StepOutcome {
    fn from(result: Result<(), CloudError>) -> Self {
        result.map_or_else(|e| StepOutcome::Failed(e.to_string()), |()| StepOutcome::Completed)
    }
}

/// What each startup step reported. A failed step never stops the ones after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub location: StepOutcome,
    pub commands: StepOutcome,
    pub camera: StepOutcome,
    pub cloud: StepOutcome,
}

impl StartupReport {
    pub fn is_degraded(&self) -> bool {
        [&self.location, &self.commands, &self.camera, &self.cloud]
            .iter()
            .any(|outcome| !outcome.is_completed())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStats {
    pub tick_count: u64,
    pub last_tick_us: u32,
    pub max_tick_us: u32,
    pub overruns: u32,
}

/// Called with `(from, to)` on every state transition.
pub type StateObserver = Box<dyn Fn(InitializationState, InitializationState) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("initialize() already ran (state {0:?})")]
    AlreadyInitialized(InitializationState),
}

/// Owns startup sequencing and the cooperative tick loop.
///
/// Subsystems are built by the caller and handed in, so tests can substitute fakes.
/// Extra commands staged with [`with_command`](Self::with_command) are registered
/// together with the capture command, before the cloud connection is initiated.
pub struct Orchestrator<L, C, K> {
    location: Arc<L>,
    camera: Arc<C>,
    cloud: Arc<K>,
    dispatcher: Arc<CommandDispatcher>,
    config: OrchestratorConfig,

    state: InitializationState,
    state_observer: Option<StateObserver>,
    staged_commands: Vec<(String, CommandHandler)>,
    sequencer: Option<Arc<CapturePublishSequencer<C, L>>>,
    startup_report: Option<StartupReport>,
    stats: TickStats,
    start_time: Instant,
}

impl<L, C, K> Orchestrator<L, C, K>
where
    L: LocationControl + 'static,
    C: CameraControl + 'static,
    K: CloudLink,
{
    pub fn new(location: Arc<L>, camera: Arc<C>, cloud: Arc<K>, config: OrchestratorConfig) -> Self {
        Self {
            location,
            camera,
            cloud,
            dispatcher: Arc::new(CommandDispatcher::new()),
            config,
            state: InitializationState::Uninitialized,
            state_observer: None,
            staged_commands: Vec::new(),
            sequencer: None,
            startup_report: None,
            stats: TickStats::default(),
            start_time: Instant::now(),
        }
    }

    pub fn with_command<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str) -> CommandResult + Send + Sync + 'static,
    {
        let handler: CommandHandler = Arc::new(handler);
        self.staged_commands.push((name.into(), handler));
        self
    }

    pub fn with_state_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(InitializationState, InitializationState) + Send + Sync + 'static,
    {
        self.state_observer = Some(Box::new(observer));
        self
    }

    /// One-time startup: location, command registration, camera, cloud, in that order.
    pub fn initialize(&mut self) -> Result<&StartupReport, OrchestratorError> {
        if self.state != InitializationState::Uninitialized {
            return Err(OrchestratorError::AlreadyInitialized(self.state));
        }
        self.advance(InitializationState::SubsystemsStarting);

        let location = StepOutcome::from(self.location.initialize_once());
        log_step("location", &location);

        let commands = self.register_commands();
        log_step("commands", &commands);

        let camera = StepOutcome::from(self.camera.initialize_once());
        log_step("camera", &camera);

        // The dispatcher only reaches the cloud here, after registration finished
        self.advance(InitializationState::CloudConnecting);
        let cloud = StepOutcome::from(self.cloud.connect(Arc::clone(&self.dispatcher)));
        log_step("cloud", &cloud);

        self.advance(InitializationState::Ready);
        let report = StartupReport {
            location,
            commands,
            camera,
            cloud,
        };
        if report.is_degraded() {
            warn!(target: "app", "startup complete with degraded subsystems");
        } else {
            info!(target: "app", "startup complete");
        }
        Ok(self.startup_report.insert(report))
    }

    /// Service location, then camera. Does nothing until initialization is done.
    pub fn tick(&mut self) {
        if self.state != InitializationState::Ready {
            trace!(target: "app", "tick ignored in {:?}", self.state);
            return;
        }

        let tick_start = Instant::now();
        let now_ms = self.uptime_ms();

        self.location.service_tick(now_ms);
        self.camera.service_tick(now_ms);

        self.record_tick(tick_start);
    }

    pub fn state(&self) -> InitializationState {
        self.state
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn startup_report(&self) -> Option<&StartupReport> {
        self.startup_report.as_ref()
    }

    pub fn get_stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn sequencer_stats(&self) -> Option<SequencerStats> {
        self.sequencer.as_ref().map(|sequencer| sequencer.get_stats())
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    fn advance(&mut self, next: InitializationState) {
        debug_assert!(
            next > self.state,
            "initialization state cannot move from {:?} to {:?}",
            self.state,
            next
        );
        if next <= self.state {
            warn!(target: "app", "ignoring state regression {:?} -> {:?}", self.state, next);
            return;
        }
        debug!(target: "app", "{:?} -> {:?}", self.state, next);
        let previous = std::mem::replace(&mut self.state, next);
        if let Some(observer) = &self.state_observer {
            observer(previous, next);
        }
    }

    fn register_commands(&mut self) -> StepOutcome {
        let mut failures: Vec<String> = Vec::new();

        let sequencer = Arc::new(CapturePublishSequencer::new(
            Arc::clone(&self.camera),
            Arc::clone(&self.location),
        ));
        if let Err(e) = self
            .dispatcher
            .register_shared(TAKE_PICTURE_COMMAND, Arc::clone(&sequencer).into_handler())
        {
            failures.push(e.to_string());
        }
        self.sequencer = Some(sequencer);

        for (name, handler) in self.staged_commands.drain(..) {
            if let Err(e) = self.dispatcher.register_shared(&name, handler) {
                failures.push(describe_registration_failure(&name, &e));
            }
        }

        if failures.is_empty() {
            StepOutcome::Completed
        } else {
            StepOutcome::Failed(failures.join("; "))
        }
    }

    fn record_tick(&mut self, tick_start: Instant) {
        let elapsed_us = u32::try_from(tick_start.elapsed().as_micros()).unwrap_or(u32::MAX);

        self.stats.tick_count = self.stats.tick_count.saturating_add(1);
        self.stats.last_tick_us = elapsed_us;
        self.stats.max_tick_us = self.stats.max_tick_us.max(elapsed_us);
        if elapsed_us > self.config.tick_budget_us {
            self.stats.overruns = self.stats.overruns.saturating_add(1);
            warn!(
                target: "app",
                "tick took {} us, budget {} us",
                elapsed_us, self.config.tick_budget_us
            );
        }
    }
}

fn describe_registration_failure(name: &str, error: &DispatchError) -> String {
    match error {
        DispatchError::Duplicate(_) => format!("`{}` registered twice", name),
        other => format!("`{}`: {}", name, other),
    }
}

fn log_step(step: &str, outcome: &StepOutcome) {
    match outcome {
        StepOutcome::Completed => info!(target: "app", "{} setup done", step),
        StepOutcome::Failed(reason) => warn!(target: "app", "{} setup failed: {}", step, reason),
    }
}
