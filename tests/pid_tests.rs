use coolbus::pid::Direction;
use coolbus::*;
use std::time::{Duration, Instant};

fn params(kp: f64, ki: f64, kd: f64) -> PidParameters {
    PidParameters {
        kp,
        ki,
        kd,
        setpoint: 50.0,
        output_min: -100.0,
        output_max: 100.0,
        integral_min: -10.0,
        integral_max: 10.0,
        direction: Direction::Direct,
    }
}

#[test]
fn test_proportional_only_output() {
    let mut pid = PidController::new(params(1.0, 0.0, 0.0));
    assert_eq!(pid.calculate(40.0), 10.0);
}

#[test]
fn test_setpoint_change_applies_next_call() {
    let mut pid = PidController::new(params(1.0, 0.0, 0.0));
    assert_eq!(pid.calculate(40.0), 10.0);

    pid.set_setpoint(60.0);
    assert_eq!(pid.setpoint(), 60.0);
    assert_eq!(pid.calculate(40.0), 20.0);
}

#[test]
fn test_reverse_direction_for_cooling() {
    let mut pid = PidController::new(PidParameters {
        direction: Direction::Reverse,
        ..params(1.0, 0.0, 0.0)
    });
    assert_eq!(pid.calculate(60.0), 10.0);
    assert_eq!(pid.calculate(45.0), -5.0);
}

#[test]
fn test_output_clamped() {
    let mut pid = PidController::new(params(100.0, 0.0, 0.0));
    assert_eq!(pid.calculate(0.0), 100.0);
    assert_eq!(pid.calculate(100.0), -100.0);
}

#[test]
fn test_integral_anti_windup() {
    let mut pid = PidController::new(params(0.0, 1.0, 0.0));
    let t0 = Instant::now();

    // Sustained error of 10 for 10 seconds would integrate to 100
    for i in 0..10 {
        pid.calculate_at(40.0, t0 + Duration::from_secs(i));
    }
    assert_eq!(pid.integral(), 10.0);

    // Error flips to -5 for one second: recovery starts from the clamp
    let output = pid.calculate_at(55.0, t0 + Duration::from_secs(10));
    assert!((pid.integral() - 5.0).abs() < 1e-9);
    assert!((output - 5.0).abs() < 1e-9);
}

#[test]
fn test_output_bounded_for_pathological_inputs() {
    let mut pid = PidController::new(params(2.5, 0.5, 0.1));
    let t0 = Instant::now();

    let inputs = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1.0e300, -1.0e300, f64::NAN];
    for (i, measured) in inputs.into_iter().enumerate() {
        let output = pid.calculate_at(measured, t0 + Duration::from_millis(100 * i as u64));
        assert!(!output.is_nan(), "NaN output for {measured}");
        assert!((-100.0..=100.0).contains(&output), "{output} out of bounds for {measured}");
        assert!((-10.0..=10.0).contains(&pid.integral()));
    }
}

#[test]
fn test_recovers_after_nan_sample() {
    let mut pid = PidController::new(params(1.0, 0.0, 0.0));
    let t0 = Instant::now();

    pid.calculate_at(f64::NAN, t0);
    let output = pid.calculate_at(40.0, t0 + Duration::from_millis(100));
    assert_eq!(output, 10.0);
}

#[test]
fn test_zero_elapsed_time_keeps_derivative() {
    let mut pid = PidController::new(params(0.0, 0.0, 1.0));
    let t0 = Instant::now();

    pid.calculate_at(40.0, t0);
    pid.calculate_at(45.0, t0 + Duration::from_millis(100));
    let derivative = pid.derivative();

    // Same instant again: no division by zero, previous derivative held
    pid.calculate_at(48.0, t0 + Duration::from_millis(100));
    assert_eq!(pid.derivative(), derivative);
}

#[test]
fn test_fan_defaults() {
    let params = PidParameters::default();
    assert_eq!((params.kp, params.ki, params.kd), (2.5, 0.5, 0.1));
    assert_eq!((params.output_min, params.output_max), (0.0, 100.0));
    assert_eq!((params.integral_min, params.integral_max), (-50.0, 50.0));
    assert_eq!(params.direction, Direction::Reverse);
}

#[test]
fn test_rejected_parameters_keep_current_ones() {
    let mut pid = PidController::new(params(1.0, 0.0, 0.0));

    let inverted = PidParameters {
        output_min: 100.0,
        output_max: -100.0,
        ..params(2.0, 0.0, 0.0)
    };
    assert!(matches!(pid.set_parameters(inverted), Err(ConfigError::Invalid(_))));

    let nan_gain = PidParameters {
        kp: f64::NAN,
        ..params(2.0, 0.0, 0.0)
    };
    assert!(pid.set_parameters(nan_gain).is_err());

    assert_eq!(pid.parameters().kp, 1.0);
    assert_eq!(pid.calculate(40.0), 10.0);

    pid.set_parameters(params(2.0, 0.0, 0.0)).unwrap();
    assert_eq!(pid.calculate(40.0), 20.0);
}

#[test]
fn test_inverted_bounds_at_construction_do_not_panic() {
    let mut pid = PidController::new(PidParameters {
        integral_min: 10.0,
        integral_max: -10.0,
        output_min: 100.0,
        output_max: -100.0,
        ..params(1.0, 1.0, 0.0)
    });
    assert!(pid.parameters().validate().is_err());

    let output = pid.calculate(40.0);
    assert!(output.is_finite());
}
