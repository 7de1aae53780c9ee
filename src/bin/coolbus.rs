use clap::{App, Arg, ArgMatches};
use colored::*;
use coolbus::{ControllerConfig, ControllerStatus, CoolingController, SystemState};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time;
use tracing::{info, warn, Level};

const STATUS_INTERVAL_MS: u64 = 1000;

/// One step of the scripted demo: sensor values, then how long to hold them.
struct ScenarioStep {
    label: &'static str,
    temperature: f64,
    level_ok: bool,
    ignition: bool,
    hold_s: u64,
    // After the hold, keep waiting until the controller is RUNNING again
    until_running: bool,
}

const fn step(label: &'static str, temperature: f64, level_ok: bool, ignition: bool, hold_s: u64) -> ScenarioStep {
    ScenarioStep {
        label,
        temperature,
        level_ok,
        ignition,
        hold_s,
        until_running: false,
    }
}

const fn recovery(label: &'static str, temperature: f64, hold_s: u64) -> ScenarioStep {
    ScenarioStep {
        until_running: true,
        ..step(label, temperature, true, true, hold_s)
    }
}

const SCENARIO: &[ScenarioStep] = &[
    step("Turning ignition ON", 25.0, true, true, 3),
    step("Temperature rising", 25.0, true, true, 1),
    step("Temperature rising", 30.0, true, true, 1),
    step("Temperature rising", 35.0, true, true, 1),
    step("Temperature rising", 40.0, true, true, 1),
    step("Temperature rising", 45.0, true, true, 1),
    step("Temperature rising", 50.0, true, true, 1),
    step("Temperature rising", 55.0, true, true, 1),
    step("Temperature rising", 60.0, true, true, 1),
    step("Temperature rising", 65.0, true, true, 1),
    step("Temperature rising", 70.0, true, true, 1),
    step("Steady state operation", 68.0, true, true, 3),
    step("Simulating low coolant level", 68.0, false, true, 5),
    recovery("Coolant level restored", 65.0, 2),
    step("Simulating over-temperature condition", 88.0, true, true, 2),
    step("Cooling down", 70.0, true, true, 2),
    step("Turning ignition OFF", 65.0, true, false, 2),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("coolbus")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("🌡️  Coolant loop controller - pump and radiator fan control over a simulated bus")
        .arg(
            Arg::with_name("setpoint")
                .short("s")
                .long("setpoint")
                .value_name("CELSIUS")
                .help("Fan PID target temperature")
                .takes_value(true)
                .validator(|v| match v.parse::<f64>() {
                    Ok(t) if t.is_finite() => Ok(()),
                    _ => Err("Setpoint must be a number".into()),
                }),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .help("Log controller status every control tick"),
        )
        .arg(
            Arg::with_name("test")
                .short("t")
                .long("test")
                .help("Run the scripted demo scenario and exit"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("duration")
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Duration must be a whole number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Status output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table"),
        )
        .get_matches();

    let debug = matches.is_present("debug");
    tracing_subscriber::fmt()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .init();

    let config = load_config(&matches)?;
    let format = matches.value_of("format").unwrap_or("table");
    let scripted = matches.is_present("test");

    println!("{}", "🌡️  Coolant Loop Controller".bright_blue().bold());
    println!(
        "{} target {:.1}°C, fan start {:.1}°C, critical {:.1}°C",
        "Config:".dimmed(),
        config.fan_pid.setpoint,
        config.thresholds.fan_start,
        config.thresholds.critical
    );

    let mut controller = CoolingController::new(config)?;
    controller.enable_debug_mode(debug);
    controller.start()?;

    let duration = matches
        .value_of("duration")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    if scripted {
        tokio::select! {
            _ = run_scenario(&controller, format) => info!("scenario complete"),
            _ = tokio::signal::ctrl_c() => warn!("interrupted"),
        }
    } else {
        println!("{}", "Press Enter or Ctrl+C to stop...".bright_green());
        tokio::select! {
            _ = monitor(&controller, format) => {}
            _ = wait_for_enter() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = sleep_for(duration) => info!("run duration elapsed"),
        }
    }

    controller.stop();

    println!("\n{}", "Final status".bright_white().bold());
    print_status(&controller.status(), format);
    println!("{}", "✅ Coolant loop controller stopped".bright_green());

    Ok(())
}

fn load_config(matches: &ArgMatches) -> Result<ControllerConfig, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };

    // Scripted runs drive every sensor themselves.
    if matches.is_present("test") {
        config.bus.simulate_sensors = false;
    }

    if let Some(setpoint) = matches.value_of("setpoint").and_then(|v| v.parse::<f64>().ok()) {
        config = config.with_target(setpoint);
    }

    config.validate()?;
    Ok(config)
}

async fn run_scenario(controller: &CoolingController, format: &str) {
    let started = Instant::now();

    for step in SCENARIO {
        println!(
            "\n{} {}",
            format!("[t={}s]", started.elapsed().as_secs()).bright_cyan(),
            step.label.bright_white()
        );

        if let Err(e) = controller.update_sensors(step.temperature, step.level_ok, step.ignition) {
            eprintln!("{} Failed to update sensors: {}", "❌".red(), e);
        }

        // Let the bus deliver the frames before sampling.
        time::sleep(Duration::from_millis(50)).await;
        print_status(&controller.status(), format);

        time::sleep(Duration::from_secs(step.hold_s)).await;

        if step.until_running && !wait_for_running(controller, format).await {
            warn!(state = %controller.get_state(), "controller did not return to RUNNING");
        }
    }
}

/// Worst case from a cleared fault back to RUNNING: the recovery hold plus priming.
fn recovery_budget(config: &ControllerConfig) -> Duration {
    config.timing.recovery_hold() + config.timing.priming_delay() + Duration::from_secs(1)
}

async fn wait_for_running(controller: &CoolingController, format: &str) -> bool {
    let deadline = Instant::now() + recovery_budget(controller.config());
    let mut interval = time::interval(Duration::from_millis(100));
    while Instant::now() < deadline {
        if controller.get_state() == SystemState::Running {
            print_status(&controller.status(), format);
            return true;
        }
        interval.tick().await;
    }
    controller.get_state() == SystemState::Running
}

async fn monitor(controller: &CoolingController, format: &str) {
    let mut interval = time::interval(Duration::from_millis(STATUS_INTERVAL_MS));
    loop {
        interval.tick().await;
        print_status(&controller.status(), format);
    }
}

async fn wait_for_enter() {
    // Off the runtime: shutdown must not wait on a pending stdin read.
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            let _ = tx.send(());
        }
    });

    // Closed stdin: run until another stop condition fires.
    if rx.await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(d) => time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

fn print_status(status: &ControllerStatus, format: &str) {
    match format {
        "json" => match status.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{} Failed to serialize status: {}", "❌".red(), e),
        },
        _ => print_status_table(status),
    }
}

fn print_status_table(status: &ControllerStatus) {
    let state = match status.state {
        SystemState::Running => status.state.as_str().bright_green(),
        SystemState::Initializing => status.state.as_str().bright_cyan(),
        SystemState::Off => status.state.as_str().white(),
        SystemState::Error => status.state.as_str().bright_red(),
        SystemState::EmergencyStop => status.state.as_str().red().bold(),
    };

    let temp = format!("{:>6.1}°C", status.temperature_c);
    let temp = if status.temperature_c > 75.0 {
        temp.red()
    } else if status.temperature_c > 60.0 {
        temp.yellow()
    } else {
        temp.white()
    };

    let pump = if status.pump_on { "  ON".bright_green() } else { " OFF".dimmed() };
    let fan = if status.fan_on {
        format!("{:>4}%", status.fan_speed).bright_green()
    } else {
        " OFF".dimmed()
    };
    let level = if status.level_ok { "  OK".bright_green() } else { " LOW".bright_red() };

    println!(
        "│ {:<14} │ {} │ pump {} │ fan {} │ level {} │ tx {:>5} │ rx {:>5} │",
        state, temp, pump, fan, level, status.bus.tx_count, status.bus.rx_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_recovers_before_critical_step() {
        let config = ControllerConfig::default();
        let critical = config.thresholds.critical;

        let fault = SCENARIO.iter().position(|s| !s.level_ok).unwrap();
        let hot = SCENARIO.iter().position(|s| s.temperature > critical).unwrap();
        assert!(fault < hot);

        // The critical sample must hit a RUNNING controller to show EMERGENCY_STOP
        let between = &SCENARIO[fault + 1..hot];
        assert!(between.iter().any(|s| s.until_running && s.level_ok && s.ignition));
        assert!(between.iter().all(|s| s.temperature < config.thresholds.max));
    }

    #[test]
    fn test_recovery_budget_covers_hold_and_priming() {
        let config = ControllerConfig::default();
        let needed = config.timing.recovery_hold() + config.timing.priming_delay();
        assert!(recovery_budget(&config) > needed);
    }
}
