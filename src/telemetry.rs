use crate::bus::BusStats;
use crate::controller::SystemState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time view of the controller, as logged each tick in debug mode
/// and printed by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub state: SystemState,
    pub temperature_c: f64,
    pub setpoint_c: f64,
    pub level_ok: bool,
    pub ignition: bool,
    pub pump_on: bool,
    pub fan_on: bool,
    pub fan_speed: u8,
    pub ticks: u64,
    pub missed_deadlines: u64,
    pub bus: BusStats,
}

impl ControllerStatus {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State: {}, Temp: {:.1}°C, Pump: {}, Fan: {}, Speed: {}%, TX: {}, RX: {}",
            self.state,
            self.temperature_c,
            on_off(self.pump_on),
            on_off(self.fan_on),
            self.fan_speed,
            self.bus.tx_count,
            self.bus.rx_count,
        )
    }
}
