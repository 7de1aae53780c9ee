//! # Coolant Loop Controller
//!
//! A simulated vehicle coolant controller built around a bounded, thread-safe
//! message bus, a guarded finite state machine and a PID fan loop.
//!
//! ## Features
//!
//! - **Bounded message bus**: fixed-capacity inbound/outbound queues, 8-byte
//!   frames, per-id subscriber callbacks dispatched without holding locks
//! - **Guarded state machine**: generic over state, event and context types,
//!   with enter/exit/transition actions
//! - **PID control**: integral anti-windup, output clamping, self-timed
//! - **Periodic orchestration**: absolute-deadline 10 Hz control loop with
//!   fan hysteresis, over-temperature and recovery timers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use coolbus::{ControllerConfig, CoolingController};
//!
//! let mut controller = CoolingController::new(ControllerConfig::default()).unwrap();
//! controller.start().unwrap();
//!
//! // Ignition on with coolant level ok and a warm engine
//! controller.update_sensors(68.0, true, true).unwrap();
//!
//! println!("{}", controller.status());
//! controller.stop();
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Message bus, frames and worker threads
//! - [`state_machine`] - Generic guarded state machine
//! - [`pid`] - PID controller
//! - [`scheduler`] - Deferred events and deadline ticking
//! - [`protocol`] - Frame payload encodings
//! - [`controller`] - The cooling controller itself
//! - [`config`] - Thresholds, ids, gains and timing
//! - [`telemetry`] - Status snapshots

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod pid;
pub mod protocol;
pub mod scheduler;
pub mod state_machine;
pub mod telemetry;

// Re-export main public types for convenience
pub use bus::{BusHandle, BusStats, Frame, MessageBus};
pub use config::ControllerConfig;
pub use controller::{CoolingController, SystemEvent, SystemState};
pub use error::{BusError, ConfigError, ControllerError};
pub use pid::{PidController, PidParameters};
pub use state_machine::{StateMachine, Transition, TransitionError};
pub use telemetry::ControllerStatus;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(CoolingController: Send);
    assert_impl_all!(StateMachine<SystemState, SystemEvent, controller::Plant>: Send);
}
