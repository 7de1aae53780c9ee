//! Error types shared across the controller.
//!
//! - [`BusError`]: publish/inject rejections on the simulated bus.
//! - [`ConfigError`]: configuration loading and validation failures.
//! - [`ControllerError`]: lifecycle failures of the cooling controller.
//!
//! State machine rejections live next to the machine as
//! [`TransitionError`](crate::state_machine::TransitionError).

use thiserror::Error;

/// Reasons a frame was not accepted by the bus.
///
/// None of these are fatal: the caller decides whether to retry, and
/// [`BusError::QueueFull`] is additionally recorded in the drop counter.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("bus is not running")]
    NotRunning,

    #[error("payload of {len} bytes exceeds the 8 byte frame limit")]
    PayloadTooLong { len: usize },

    #[error("outbound queue full ({capacity} frames); frame dropped")]
    QueueFull { capacity: usize },

    #[error("inbound queue full ({capacity} frames); frame dropped")]
    InboundQueueFull { capacity: usize },
}

impl BusError {
    /// Short snake_case label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::NotRunning => "bus_not_running",
            BusError::PayloadTooLong { .. } => "bus_payload_too_long",
            BusError::QueueFull { .. } => "bus_queue_full",
            BusError::InboundQueueFull { .. } => "bus_inbound_queue_full",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("controller is already running")]
    AlreadyRunning,
}
