//! # Tracker Camera Orchestration Core
//!
//! Startup sequencing, cooperative servicing and the remote command surface for a
//! battery-powered asset tracker with an attached camera accessory.
//!
//! ## Features
//!
//! - **Ordered startup**: location, command registration, camera power-up, then
//!   cloud connection, with best-effort handling of failing steps
//! - **Non-blocking tick loop**: every subsystem is an incremental state machine
//!   serviced once per tick, location first
//! - **Remote commands**: a bounded name → handler table invoked synchronously from
//!   the connectivity stack's context
//! - **Capture and report**: `takePicture` triggers a capture and an out-of-cycle
//!   location publish and returns as soon as both are issued
//! - **Chunked image upload**: start/chunk events with backend-driven resend,
//!   restart and done
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use trackcam::cloud::LoopbackCloud;
//! use trackcam::config::TrackerConfig;
//! use trackcam::subsystems::{CameraAdapter, LocationTracker, SimulatedRail};
//! use trackcam::Orchestrator;
//!
//! let config = TrackerConfig::default();
//! let cloud = Arc::new(LoopbackCloud::new(config.cloud.clone()));
//! let location = Arc::new(LocationTracker::new(config.location.clone(), Arc::clone(&cloud)));
//! let camera = Arc::new(CameraAdapter::new(
//!     config.camera.clone(),
//!     SimulatedRail::new(),
//!     Arc::clone(&cloud),
//! ));
//!
//! let mut orchestrator = Orchestrator::new(location, camera, cloud, config.orchestrator.clone());
//! orchestrator.initialize().unwrap();
//! orchestrator.tick();
//! ```
//!
//! ## Architecture
//!
//! - [`orchestrator`] - Startup sequencing and the tick loop
//! - [`dispatcher`] - Remote command table
//! - [`sequencer`] - The capture-then-publish command
//! - [`subsystems`] - Subsystem contracts plus the location and camera implementations
//! - [`upload`] - Image upload protocol, device and backend halves
//! - [`cloud`] - Connectivity stack boundary and a loopback implementation
//! - [`config`] - JSON configuration

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::return_self_not_must_use)]

pub mod cloud;
pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod sequencer;
pub mod subsystems;
pub mod upload;

// Re-export main public types for convenience
pub use dispatcher::{CommandDispatcher, CommandInvocation, CommandResult};
pub use orchestrator::{InitializationState, Orchestrator, StartupReport};
pub use subsystems::{CameraControl, LocationControl, Subsystem};
