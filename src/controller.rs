//! # Cooling controller
//!
//! Ties the bus, the state machine and the fan PID together.
//!
//! ```text
//!   bus-rx thread                         control thread (10 Hz)
//!   ─────────────                         ──────────────────────
//!   temperature ─┐                        deferred events (priming)
//!   level ───────┼─► lock(state) ◄──────  over-temp / recovery timers
//!   ignition ────┘     │                  fan hysteresis + PID
//!                      ▼                        │
//!               StateMachine + Plant ◄──────────┘
//!                      │ (outputs snapshot, lock released)
//!                      ▼
//!               publish pump / fan frames ──► bus-tx thread
//! ```
//!
//! ## Locking
//! - One mutex guards the state machine together with the [`Plant`] (sensor
//!   readings, actuator commands, PID, timers). Every read-decide-transition
//!   sequence, guards included, runs under it.
//! - Outputs are snapshotted under that mutex and published after it is
//!   released. A sequence number keeps a late snapshot from overwriting a
//!   newer one on the bus.

use crate::bus::{lock, BusHandle, Frame, MessageBus};
use crate::config::{ControllerConfig, TemperatureThresholds};
use crate::error::{BusError, ControllerError};
use crate::pid::PidController;
use crate::protocol::{self, FanCommand, MAX_FAN_SPEED};
use crate::scheduler::{DeadlineTicker, EventScheduler};
use crate::state_machine::{StateHandlers, StateMachine, Transition, TransitionError};
use crate::telemetry::ControllerStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

const INITIAL_TEMPERATURE_C: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemState {
    Off,
    Initializing,
    Running,
    Error,
    EmergencyStop,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Off => "OFF",
            SystemState::Initializing => "INITIALIZING",
            SystemState::Running => "RUNNING",
            SystemState::Error => "ERROR",
            SystemState::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemEvent {
    IgnitionOn,
    IgnitionOff,
    InitComplete,
    LowCoolant,
    OverTemp,
    CriticalTemp,
    ErrorCleared,
    TempNormal,
}

pub type ControllerMachine = StateMachine<SystemState, SystemEvent, Plant>;
pub type ControllerTransitionError = TransitionError<SystemState, SystemEvent>;

/// Actuator commands as they go out on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorOutputs {
    pub pump_on: bool,
    pub fan: FanCommand,
}

/// Sensor readings, actuator commands and control-loop bookkeeping.
///
/// This is the context every state machine handler runs against.
#[derive(Debug)]
pub struct Plant {
    pub temperature: f64,
    pub level_ok: bool,
    pub ignition: bool,

    pump_on: bool,
    fan_on: bool,
    fan_speed: u8,
    output_seq: u64,
    outputs_dirty: bool,

    fan_pid: PidController,
    deferred: EventScheduler<SystemState, SystemEvent>,
    over_temp_since: Option<Instant>,
    recovery_since: Option<Instant>,
}

impl Plant {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            temperature: INITIAL_TEMPERATURE_C,
            level_ok: true,
            ignition: false,
            pump_on: false,
            fan_on: false,
            fan_speed: 0,
            output_seq: 0,
            outputs_dirty: false,
            fan_pid: PidController::new(config.fan_pid),
            deferred: EventScheduler::new(),
            over_temp_since: None,
            recovery_since: None,
        }
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    pub fn fan_on(&self) -> bool {
        self.fan_on
    }

    pub fn fan_speed(&self) -> u8 {
        self.fan_speed
    }

    pub fn fan_pid(&self) -> &PidController {
        &self.fan_pid
    }

    pub fn deferred(&self) -> &EventScheduler<SystemState, SystemEvent> {
        &self.deferred
    }

    pub fn outputs(&self) -> ActuatorOutputs {
        ActuatorOutputs {
            pump_on: self.pump_on,
            fan: FanCommand {
                on: self.fan_on,
                speed: self.fan_speed,
            },
        }
    }

    fn set_outputs(&mut self, pump_on: bool, fan_on: bool, fan_speed: u8) {
        if (pump_on, fan_on, fan_speed) != (self.pump_on, self.fan_on, self.fan_speed) {
            self.pump_on = pump_on;
            self.fan_on = fan_on;
            self.fan_speed = fan_speed;
            self.output_seq += 1;
            self.outputs_dirty = true;
        }
    }

    fn all_off(&mut self) {
        self.set_outputs(false, false, 0);
    }

    /// Fan control with a hysteresis band.
    ///
    /// Above `fan_start` the fan runs at the PID output. At or below
    /// `fan_start - hysteresis_band` it is switched off and the PID history
    /// is dropped. In between, the previous on/off decision is held.
    pub fn regulate_fan(&mut self, thresholds: &TemperatureThresholds, now: Instant) {
        let temp = self.temperature;

        if temp > thresholds.fan_start {
            let output = self.fan_pid.calculate_at(temp, now);
            let speed = output.round().clamp(0.0, f64::from(MAX_FAN_SPEED)) as u8;
            self.set_outputs(self.pump_on, true, speed);
        } else if temp <= thresholds.fan_stop() {
            if self.fan_on {
                self.fan_pid.reset();
            }
            self.set_outputs(self.pump_on, false, 0);
        }
    }
}

/// Build the controller's transition table.
///
/// | from           | event          | to             | guard        |
/// |----------------|----------------|----------------|--------------|
/// | OFF            | IGNITION_ON    | INITIALIZING   | level ok     |
/// | INITIALIZING   | INIT_COMPLETE  | RUNNING        |              |
/// | INITIALIZING   | IGNITION_OFF   | OFF            |              |
/// | INITIALIZING   | LOW_COOLANT    | ERROR          |              |
/// | RUNNING        | IGNITION_OFF   | OFF            |              |
/// | RUNNING        | LOW_COOLANT    | ERROR          |              |
/// | RUNNING        | OVER_TEMP      | ERROR          |              |
/// | RUNNING        | CRITICAL_TEMP  | EMERGENCY_STOP |              |
/// | ERROR          | ERROR_CLEARED  | INITIALIZING   | ignition on  |
/// | ERROR          | IGNITION_OFF   | OFF            |              |
/// | EMERGENCY_STOP | TEMP_NORMAL    | ERROR          |              |
pub fn build_state_machine(config: &ControllerConfig) -> ControllerMachine {
    use SystemEvent as Ev;
    use SystemState as St;

    let priming_delay = config.timing.priming_delay();
    let mut fsm = StateMachine::new(St::Off);

    fsm.add_state(St::Off, StateHandlers::new().on_enter(Plant::all_off));

    fsm.add_state(
        St::Initializing,
        StateHandlers::new()
            .on_enter(move |plant: &mut Plant| {
                plant.set_outputs(true, plant.fan_on, plant.fan_speed);
                let due = Instant::now() + priming_delay;
                if let Err(e) = plant.deferred.schedule(Ev::InitComplete, due, St::Initializing) {
                    warn!(error = e, "failed to arm priming timer");
                }
                debug!(?priming_delay, "pump priming");
            })
            .on_exit(|plant: &mut Plant| {
                plant.deferred.cancel_armed_in(St::Initializing);
            }),
    );

    fsm.add_state(
        St::Running,
        StateHandlers::new()
            .on_enter(|plant: &mut Plant| {
                plant.over_temp_since = None;
            })
            .on_exit(|plant: &mut Plant| {
                plant.fan_pid.reset();
                plant.over_temp_since = None;
            }),
    );

    fsm.add_state(
        St::Error,
        StateHandlers::new().on_enter(|plant: &mut Plant| {
            plant.all_off();
            plant.recovery_since = None;
        }),
    );

    fsm.add_state(
        St::EmergencyStop,
        StateHandlers::new().on_enter(|plant: &mut Plant| {
            plant.set_outputs(false, true, MAX_FAN_SPEED);
        }),
    );

    fsm.add_transition(
        Transition::new(St::Off, Ev::IgnitionOn, St::Initializing)
            .guard(|plant: &Plant, _| plant.level_ok),
    );
    fsm.add_transition(Transition::new(St::Initializing, Ev::InitComplete, St::Running));
    fsm.add_transition(Transition::new(St::Initializing, Ev::IgnitionOff, St::Off));
    fsm.add_transition(Transition::new(St::Initializing, Ev::LowCoolant, St::Error));
    fsm.add_transition(Transition::new(St::Running, Ev::IgnitionOff, St::Off));
    fsm.add_transition(Transition::new(St::Running, Ev::LowCoolant, St::Error));
    fsm.add_transition(Transition::new(St::Running, Ev::OverTemp, St::Error));
    fsm.add_transition(Transition::new(St::Running, Ev::CriticalTemp, St::EmergencyStop));
    fsm.add_transition(
        Transition::new(St::Error, Ev::ErrorCleared, St::Initializing)
            .guard(|plant: &Plant, _| plant.ignition),
    );
    fsm.add_transition(Transition::new(St::Error, Ev::IgnitionOff, St::Off));
    fsm.add_transition(Transition::new(St::EmergencyStop, Ev::TempNormal, St::Error));

    fsm
}

struct ControlState {
    machine: ControllerMachine,
    plant: Plant,
}

impl ControlState {
    fn current(&self) -> SystemState {
        self.machine.current_state()
    }

    fn post(&mut self, event: SystemEvent) -> Result<SystemState, ControllerTransitionError> {
        let from = self.machine.current_state();
        match self.machine.process_event(event, &mut self.plant) {
            Ok(to) => {
                info!(%from, %to, ?event, "state transition");
                Ok(to)
            }
            Err(e @ TransitionError::GuardRejected { .. }) => {
                warn!(%from, ?event, "transition guard rejected event");
                Err(e)
            }
            Err(e) => {
                debug!(%from, ?event, "event ignored in current state");
                Err(e)
            }
        }
    }

    fn take_outputs(&mut self) -> Option<(u64, ActuatorOutputs)> {
        if !self.plant.outputs_dirty {
            return None;
        }
        self.plant.outputs_dirty = false;
        Some((self.plant.output_seq, self.plant.outputs()))
    }
}

struct ControllerCore {
    config: ControllerConfig,
    bus: BusHandle,
    state: Mutex<ControlState>,
    // Sequence number of the last outputs put on the bus
    published_seq: Mutex<Option<u64>>,
    // Set when the bus refused a snapshot; the next tick sends the current one
    resend: AtomicBool,
    debug: AtomicBool,
    ticks: AtomicU64,
    missed_deadlines: AtomicU64,
}

impl ControllerCore {
    fn on_temperature(&self, frame: &Frame) {
        let Some(temp) = protocol::decode_temperature(frame.data()) else {
            warn!(len = frame.len(), "short temperature frame ignored");
            return;
        };

        let thresholds = &self.config.thresholds;
        let outputs = {
            let mut state = lock(&self.state);
            state.plant.temperature = temp;
            match state.current() {
                SystemState::Running if temp > thresholds.critical => {
                    warn!(temp, critical = thresholds.critical, "critical coolant temperature");
                    let _ = state.post(SystemEvent::CriticalTemp);
                }
                SystemState::EmergencyStop if temp < thresholds.max => {
                    let _ = state.post(SystemEvent::TempNormal);
                }
                _ => {}
            }
            state.take_outputs()
        };

        self.publish_outputs(outputs);
    }

    fn on_level(&self, frame: &Frame) {
        let Some(level_ok) = protocol::decode_flag(frame.data()) else {
            warn!("empty level frame ignored");
            return;
        };

        let outputs = {
            let mut state = lock(&self.state);
            if level_ok != state.plant.level_ok {
                state.plant.level_ok = level_ok;
                if !level_ok {
                    warn!("coolant level low");
                    if matches!(state.current(), SystemState::Running | SystemState::Initializing) {
                        let _ = state.post(SystemEvent::LowCoolant);
                    }
                }
            }
            state.take_outputs()
        };

        self.publish_outputs(outputs);
    }

    fn on_ignition(&self, frame: &Frame) {
        let Some(ignition) = protocol::decode_flag(frame.data()) else {
            warn!("empty ignition frame ignored");
            return;
        };

        let outputs = {
            let mut state = lock(&self.state);
            if ignition != state.plant.ignition {
                state.plant.ignition = ignition;
                let event = if ignition {
                    SystemEvent::IgnitionOn
                } else {
                    SystemEvent::IgnitionOff
                };
                let _ = state.post(event);
            }
            state.take_outputs()
        };

        self.publish_outputs(outputs);
    }

    /// One control-loop iteration.
    fn tick(&self, now: Instant) {
        let thresholds = &self.config.thresholds;
        let timing = &self.config.timing;

        let outputs = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            let current = state.current();
            for event in state.plant.deferred.take_due(now, current) {
                let _ = state.post(event);
            }

            match state.current() {
                SystemState::Running => {
                    let plant = &mut state.plant;
                    if plant.temperature > thresholds.critical {
                        // Sample may have arrived before RUNNING was reached
                        warn!(temp = plant.temperature, "critical temperature while running");
                        let _ = state.post(SystemEvent::CriticalTemp);
                    } else if plant.temperature > thresholds.max {
                        let since = *plant.over_temp_since.get_or_insert(now);
                        if now.saturating_duration_since(since) >= timing.over_temp_timeout() {
                            warn!(temp = plant.temperature, "over-temperature timeout");
                            let _ = state.post(SystemEvent::OverTemp);
                        }
                    } else {
                        plant.over_temp_since = None;
                    }

                    if state.current() == SystemState::Running {
                        state.plant.regulate_fan(thresholds, now);
                    }
                }
                SystemState::Error => {
                    let plant = &mut state.plant;
                    if !plant.ignition {
                        // Ignition dropped while in a state without an IGNITION_OFF edge
                        plant.recovery_since = None;
                        let _ = state.post(SystemEvent::IgnitionOff);
                    } else if plant.level_ok && plant.temperature < thresholds.max {
                        let since = *plant.recovery_since.get_or_insert(now);
                        if now.saturating_duration_since(since) >= timing.recovery_hold() {
                            plant.recovery_since = None;
                            info!("fault conditions cleared, restarting");
                            let _ = state.post(SystemEvent::ErrorCleared);
                        }
                    } else {
                        plant.recovery_since = None;
                    }
                }
                _ => {}
            }

            if self.debug.load(Ordering::Relaxed) {
                info!("{}", self.status_of(state));
            }

            let resend = self.resend.swap(false, Ordering::Relaxed);
            state
                .take_outputs()
                .or_else(|| resend.then(|| (state.plant.output_seq, state.plant.outputs())))
        };

        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.publish_outputs(outputs);
    }

    /// The only path by which actuator commands reach the bus.
    fn publish_outputs(&self, outputs: Option<(u64, ActuatorOutputs)>) {
        let Some((seq, outputs)) = outputs else {
            return;
        };

        let mut published = lock(&self.published_seq);
        if published.is_some_and(|last| seq <= last) {
            return;
        }

        let ids = &self.config.bus_ids;
        let pump = self
            .bus
            .publish(ids.pump_command, &protocol::encode_pump_command(outputs.pump_on));
        let fan = self.bus.publish(ids.fan_command, &outputs.fan.encode());

        if pump.is_ok() && fan.is_ok() {
            *published = Some(seq);
            return;
        }

        self.resend.store(true, Ordering::Relaxed);
        for result in [pump, fan] {
            match result {
                Ok(()) => {}
                Err(BusError::NotRunning) => debug!(seq, "bus stopped, actuator command deferred"),
                Err(e) => warn!(seq, error = %e, label = e.as_label(), "actuator command deferred"),
            }
        }
    }

    fn status_of(&self, state: &ControlState) -> ControllerStatus {
        let plant = &state.plant;
        ControllerStatus {
            state: state.current(),
            temperature_c: plant.temperature,
            setpoint_c: plant.fan_pid.setpoint(),
            level_ok: plant.level_ok,
            ignition: plant.ignition,
            pump_on: plant.pump_on,
            fan_on: plant.fan_on,
            fan_speed: plant.fan_speed,
            ticks: self.ticks.load(Ordering::Relaxed),
            missed_deadlines: self.missed_deadlines.load(Ordering::Relaxed),
            bus: self.bus.stats(),
        }
    }
}

fn control_loop(core: &ControllerCore, stop_rx: &mpsc::Receiver<()>) {
    let mut ticker = DeadlineTicker::new(Instant::now(), core.config.timing.control_period());
    info!(period = ?ticker.period(), "control loop started");

    loop {
        core.tick(Instant::now());
        ticker.advance();

        match ticker.wait_from(Instant::now()) {
            Some(wait) => match stop_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            },
            None => {
                let missed = core.missed_deadlines.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(missed, tick = ticker.ticks(), "control loop missed its deadline");
                match stop_rx.try_recv() {
                    Err(TryRecvError::Empty) => {}
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }
    }

    info!(ticks = ticker.ticks(), "control loop stopped");
}

/// The cooling controller.
///
/// Owns the bus and the control thread. Dropping the controller stops it.
pub struct CoolingController {
    core: Arc<ControllerCore>,
    bus: MessageBus,
    control: Option<ControlThread>,
}

struct ControlThread {
    handle: JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
}

impl CoolingController {
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        config.validate()?;

        let mut bus_config = config.bus;
        bus_config.synthetic_sensor_id = config.bus_ids.temperature_sensor;
        let bus = MessageBus::new(bus_config);

        let plant = Plant::new(&config);
        let machine = build_state_machine(&config);

        let core = Arc::new(ControllerCore {
            config,
            bus: bus.handle(),
            state: Mutex::new(ControlState { machine, plant }),
            published_seq: Mutex::new(None),
            resend: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            missed_deadlines: AtomicU64::new(0),
        });

        let controller = Self {
            core,
            bus,
            control: None,
        };
        controller.setup_bus_handlers();
        Ok(controller)
    }

    fn setup_bus_handlers(&self) {
        let ids = self.core.config.bus_ids;
        let bus = self.bus.handle();

        // Weak: the bus registry must not keep the controller alive.
        let core = Arc::downgrade(&self.core);
        bus.subscribe(ids.temperature_sensor, with_core(&core, ControllerCore::on_temperature));
        bus.subscribe(ids.level_sensor, with_core(&core, ControllerCore::on_level));
        bus.subscribe(ids.ignition, with_core(&core, ControllerCore::on_ignition));
    }

    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.control.is_some() {
            return Err(ControllerError::AlreadyRunning);
        }

        self.bus.start()?;

        let (stop_tx, stop_rx) = mpsc::channel();
        let core = Arc::clone(&self.core);
        let spawned = thread::Builder::new()
            .name("control-loop".into())
            .spawn(move || control_loop(&core, &stop_rx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.bus.stop();
                return Err(e.into());
            }
        };
        self.control = Some(ControlThread { handle, stop_tx });

        // Put the current actuator state on the bus.
        let outputs = {
            let mut state = lock(&self.core.state);
            state.plant.output_seq += 1;
            Some((state.plant.output_seq, state.plant.outputs()))
        };
        self.core.publish_outputs(outputs);

        info!(state = %self.get_state(), "cooling system started");
        Ok(())
    }

    /// Stop the control thread and the bus, joining all of them.
    pub fn stop(&mut self) {
        let Some(control) = self.control.take() else {
            return;
        };

        // A send error only means the thread is already gone.
        let _ = control.stop_tx.send(());
        if control.handle.join().is_err() {
            warn!("control thread panicked");
        }
        self.bus.stop();

        info!(state = %self.get_state(), "cooling system stopped");
    }

    pub fn is_running(&self) -> bool {
        self.control.is_some()
    }

    pub fn set_temperature_setpoint(&self, setpoint: f64) {
        lock(&self.core.state).plant.fan_pid.set_setpoint(setpoint);
        info!(setpoint, "temperature setpoint changed");
    }

    pub fn enable_debug_mode(&self, enable: bool) {
        self.core.debug.store(enable, Ordering::Relaxed);
    }

    pub fn is_debug_mode(&self) -> bool {
        self.core.debug.load(Ordering::Relaxed)
    }

    pub fn get_state(&self) -> SystemState {
        lock(&self.core.state).current()
    }

    pub fn get_current_temperature(&self) -> f64 {
        lock(&self.core.state).plant.temperature
    }

    pub fn get_fan_speed(&self) -> u8 {
        lock(&self.core.state).plant.fan_speed
    }

    pub fn is_fan_on(&self) -> bool {
        lock(&self.core.state).plant.fan_on
    }

    pub fn is_pump_on(&self) -> bool {
        lock(&self.core.state).plant.pump_on
    }

    pub fn status(&self) -> ControllerStatus {
        let state = lock(&self.core.state);
        self.core.status_of(&state)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.core.config
    }

    pub fn bus(&self) -> BusHandle {
        self.bus.handle()
    }

    /// Feed one sensor sample set through the bus, as the sensors would.
    pub fn update_sensors(&self, temperature: f64, level_ok: bool, ignition: bool) -> Result<(), BusError> {
        let ids = &self.core.config.bus_ids;
        self.bus.inject(ids.level_sensor, &protocol::encode_flag(level_ok))?;
        self.bus.inject(ids.ignition, &protocol::encode_flag(ignition))?;
        self.bus
            .inject(ids.temperature_sensor, &protocol::encode_temperature(temperature))
    }

    pub fn inject_frame(&self, id: u32, data: &[u8]) -> Result<(), BusError> {
        self.bus.inject(id, data)
    }

    /// Post `event` to the state machine directly.
    pub fn post_event(&self, event: SystemEvent) -> Result<SystemState, ControllerTransitionError> {
        let (result, outputs) = {
            let mut state = lock(&self.core.state);
            let result = state.post(event);
            (result, state.take_outputs())
        };
        self.core.publish_outputs(outputs);
        result
    }

    /// Operator reset out of ERROR. Still requires ignition on.
    pub fn clear_error(&self) -> Result<SystemState, ControllerTransitionError> {
        self.post_event(SystemEvent::ErrorCleared)
    }
}

impl Drop for CoolingController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn with_core(
    core: &Weak<ControllerCore>,
    handler: fn(&ControllerCore, &Frame),
) -> impl Fn(&Frame) + Send + Sync + 'static {
    let core = core.clone();
    move |frame: &Frame| {
        if let Some(core) = core.upgrade() {
            handler(&core, frame);
        }
    }
}
