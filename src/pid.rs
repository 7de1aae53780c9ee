//! PID controller with integral anti-windup and output clamping.
//!
//! The controller owns its timing: each [`PidController::calculate`] call
//! measures the time since the previous call. The first call after
//! construction or [`PidController::reset`] has no previous sample and uses
//! [`DEFAULT_DT_S`] instead.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Sample period assumed when there is no previous sample.
pub const DEFAULT_DT_S: f64 = 0.1;

/// Which way the error is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// `error = setpoint - measured`: output rises when the measurement is low.
    Direct,
    /// `error = measured - setpoint`: output rises when the measurement is high
    /// (cooling actuators).
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidParameters {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub integral_min: f64,
    pub integral_max: f64,
    pub direction: Direction,
}

impl PidParameters {
    /// Gains and bounds used for the radiator fan.
    pub fn fan_default(setpoint: f64) -> Self {
        Self {
            kp: 2.5,
            ki: 0.5,
            kd: 0.1,
            setpoint,
            output_min: 0.0,
            output_max: 100.0,
            integral_min: -50.0,
            integral_max: 50.0,
            direction: Direction::Reverse,
        }
    }

    /// All values finite and neither bound pair inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let values = [
            self.kp, self.ki, self.kd, self.setpoint,
            self.output_min, self.output_max, self.integral_min, self.integral_max,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::Invalid("PID parameters must be finite".into()));
        }
        if self.output_min > self.output_max {
            return Err(ConfigError::Invalid("PID output bounds are inverted".into()));
        }
        if self.integral_min > self.integral_max {
            return Err(ConfigError::Invalid("PID integral bounds are inverted".into()));
        }
        Ok(())
    }
}

impl Default for PidParameters {
    fn default() -> Self {
        Self::fan_default(65.0)
    }
}

#[derive(Debug, Clone)]
pub struct PidController {
    params: PidParameters,
    integral: f64,
    last_error: f64,
    derivative: f64,
    last_time: Option<Instant>,
}

impl PidController {
    /// Parameters are taken as given. Inverted bounds never panic, but
    /// callers wanting them rejected should run [`PidParameters::validate`].
    pub fn new(params: PidParameters) -> Self {
        Self {
            params,
            integral: 0.0,
            last_error: 0.0,
            derivative: 0.0,
            last_time: None,
        }
    }

    /// Compute the next output for `measured`, sampling the clock now.
    pub fn calculate(&mut self, measured: f64) -> f64 {
        self.calculate_at(measured, Instant::now())
    }

    /// Compute the next output for `measured` as if sampled at `now`.
    pub fn calculate_at(&mut self, measured: f64, now: Instant) -> f64 {
        let error = match self.params.direction {
            Direction::Direct => self.params.setpoint - measured,
            Direction::Reverse => measured - self.params.setpoint,
        };

        let (dt, first_run) = match self.last_time {
            Some(last) => (now.saturating_duration_since(last).as_secs_f64(), false),
            None => (DEFAULT_DT_S, true),
        };

        let p_term = self.params.kp * error;

        // Clamp the accumulator, not the term. A NaN sample leaves the
        // history untouched.
        let integral = self.integral + error * dt;
        if !integral.is_nan() {
            self.integral = bound(integral, self.params.integral_min, self.params.integral_max);
        }
        let i_term = self.params.ki * self.integral;

        if !first_run && dt > 0.0 {
            let derivative = (error - self.last_error) / dt;
            if derivative.is_finite() {
                self.derivative = derivative;
            }
        }
        let d_term = self.params.kd * self.derivative;

        let mut output = p_term + i_term + d_term;
        if output.is_nan() {
            output = self.params.output_min;
        }
        let output = bound(output, self.params.output_min, self.params.output_max);

        if !error.is_nan() {
            self.last_error = error;
        }
        self.last_time = Some(now);

        output
    }

    /// Forget accumulated history. The next call behaves like the first.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.derivative = 0.0;
        self.last_time = None;
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.params.setpoint = setpoint;
    }

    /// Replace gains, bounds and setpoint. Rejected parameters leave the
    /// current ones in place.
    pub fn set_parameters(&mut self, params: PidParameters) -> Result<(), ConfigError> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    pub fn parameters(&self) -> &PidParameters {
        &self.params
    }

    pub fn setpoint(&self) -> f64 {
        self.params.setpoint
    }

    pub fn error(&self) -> f64 {
        self.last_error
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn derivative(&self) -> f64 {
        self.derivative
    }

    pub fn is_first_run(&self) -> bool {
        self.last_time.is_none()
    }
}

// Unlike `f64::clamp`, never panics on inverted or NaN bounds.
fn bound(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn proportional_only() -> PidParameters {
        PidParameters {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            setpoint: 50.0,
            output_min: -100.0,
            output_max: 100.0,
            integral_min: -10.0,
            integral_max: 10.0,
            direction: Direction::Direct,
        }
    }

    #[test]
    fn test_first_run_uses_default_dt() {
        let mut pid = PidController::new(PidParameters {
            ki: 1.0,
            ..proportional_only()
        });
        pid.calculate_at(40.0, Instant::now());

        // error 10 * 0.1s
        assert!((pid.integral() - 1.0).abs() < 1e-9);
        assert_eq!(pid.derivative(), 0.0);
        assert!(!pid.is_first_run());
    }

    #[test]
    fn test_derivative_uses_elapsed_time() {
        let mut pid = PidController::new(proportional_only());
        let t0 = Instant::now();
        pid.calculate_at(40.0, t0);
        pid.calculate_at(45.0, t0 + Duration::from_millis(500));

        // error went 10 -> 5 over 0.5s
        assert!((pid.derivative() + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut pid = PidController::new(PidParameters {
            ki: 1.0,
            kd: 1.0,
            ..proportional_only()
        });
        let t0 = Instant::now();
        pid.calculate_at(40.0, t0);
        pid.calculate_at(30.0, t0 + Duration::from_millis(100));
        pid.reset();

        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.error(), 0.0);
        assert_eq!(pid.derivative(), 0.0);
        assert!(pid.is_first_run());
    }
}
