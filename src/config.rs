//! Controller configuration.
//!
//! A single immutable [`ControllerConfig`] is handed to
//! [`CoolingController::new`](crate::controller::CoolingController::new).
//! Every section implements `Default` with the reference values, and the
//! whole tree deserializes from JSON with missing fields filled in.

use crate::error::ConfigError;
use crate::pid::PidParameters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_TARGET_C: f64 = 65.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub thresholds: TemperatureThresholds,
    pub bus_ids: BusIds,
    pub fan_pid: PidParameters,
    pub timing: TimingConfig,
    pub bus: BusConfig,
}

/// Temperature thresholds in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureThresholds {
    pub min: f64,
    pub target: f64,
    pub max: f64,
    pub critical: f64,
    pub fan_start: f64,
    /// Dead zone below `fan_start` before the fan is switched back off.
    pub hysteresis_band: f64,
}

impl Default for TemperatureThresholds {
    fn default() -> Self {
        Self {
            min: 50.0,
            target: DEFAULT_TARGET_C,
            max: 75.0,
            critical: 85.0,
            fan_start: 60.0,
            hysteresis_band: 5.0,
        }
    }
}

impl TemperatureThresholds {
    /// Temperature at or below which the fan is switched off.
    pub fn fan_stop(&self) -> f64 {
        self.fan_start - self.hysteresis_band
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusIds {
    pub temperature_sensor: u32,
    pub level_sensor: u32,
    pub ignition: u32,
    pub pump_command: u32,
    pub fan_command: u32,
}

impl Default for BusIds {
    fn default() -> Self {
        Self {
            temperature_sensor: 0x100,
            level_sensor: 0x101,
            ignition: 0x102,
            pump_command: 0x200,
            fan_command: 0x201,
        }
    }
}

impl BusIds {
    fn all(&self) -> [u32; 5] {
        [
            self.temperature_sensor,
            self.level_sensor,
            self.ignition,
            self.pump_command,
            self.fan_command,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub control_period_ms: u64,
    pub priming_delay_ms: u64,
    pub over_temp_timeout_ms: u64,
    pub recovery_hold_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            control_period_ms: 100, // 10 Hz
            priming_delay_ms: 2_000,
            over_temp_timeout_ms: 10_000,
            recovery_hold_ms: 5_000,
        }
    }
}

impl TimingConfig {
    pub fn control_period(&self) -> Duration {
        Duration::from_millis(self.control_period_ms)
    }

    pub fn priming_delay(&self) -> Duration {
        Duration::from_millis(self.priming_delay_ms)
    }

    pub fn over_temp_timeout(&self) -> Duration {
        Duration::from_millis(self.over_temp_timeout_ms)
    }

    pub fn recovery_hold(&self) -> Duration {
        Duration::from_millis(self.recovery_hold_ms)
    }
}

/// Simulated bus behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub node_id: u32,
    /// Synthesize temperature frames on the inbound thread.
    pub simulate_sensors: bool,
    pub min_inbound_interval_ms: u64,
    pub max_inbound_interval_ms: u64,
    pub tx_delay_us: u64,
    pub rng_seed: u64,
    /// Identifier used for synthesized temperature frames.
    pub synthetic_sensor_id: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: 0x01,
            simulate_sensors: true,
            min_inbound_interval_ms: 100,
            max_inbound_interval_ms: 500,
            tx_delay_us: 100,
            rng_seed: 0x1234_5678_9ABC_DEF0,
            synthetic_sensor_id: 0x100,
        }
    }
}

impl BusConfig {
    /// Bus with sensor synthesis turned off; all inbound traffic is injected.
    pub fn quiet() -> Self {
        Self {
            simulate_sensors: false,
            ..Self::default()
        }
    }

    pub fn tx_delay(&self) -> Duration {
        Duration::from_micros(self.tx_delay_us)
    }
}

impl ControllerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.sync_fan_setpoint(json);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Replace the target temperature and the fan setpoint together.
    pub fn with_target(mut self, target: f64) -> Self {
        self.thresholds.target = target;
        self.fan_pid.setpoint = target;
        self
    }

    // A file that only sets `thresholds.target` expects the fan to follow it.
    fn sync_fan_setpoint(&mut self, json: &str) {
        let pid_setpoint_given = serde_json::from_str::<serde_json::Value>(json)
            .ok()
            .and_then(|v| v.get("fan_pid").and_then(|p| p.get("setpoint")).cloned())
            .is_some();
        if !pid_setpoint_given {
            self.fan_pid.setpoint = self.thresholds.target;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        let temps = [t.min, t.target, t.max, t.critical, t.fan_start, t.hysteresis_band];
        if temps.iter().any(|v| !v.is_finite()) {
            return Err(invalid("temperature thresholds must be finite"));
        }
        if t.hysteresis_band < 0.0 {
            return Err(invalid("hysteresis band must not be negative"));
        }
        if t.min > t.max {
            return Err(invalid("min temperature above max temperature"));
        }
        if t.max >= t.critical {
            return Err(invalid("max temperature must be below critical temperature"));
        }

        self.fan_pid.validate()?;

        if self.timing.control_period_ms == 0 {
            return Err(invalid("control period must be non-zero"));
        }

        let ids = self.bus_ids.all();
        for (i, id) in ids.iter().enumerate() {
            if ids[i + 1..].contains(id) {
                return Err(invalid(&format!("bus id {id:#x} assigned twice")));
            }
        }

        if self.bus.min_inbound_interval_ms > self.bus.max_inbound_interval_ms {
            return Err(invalid("inbound interval range is empty"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_owned())
}
