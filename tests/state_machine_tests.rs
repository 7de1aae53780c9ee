use coolbus::controller::{build_state_machine, Plant};
use coolbus::state_machine::StateHandlers;
use coolbus::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Door {
    Closed,
    Open,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Push {
    Open,
    Close,
    Lock,
}

#[derive(Default)]
struct Trace {
    calls: Vec<&'static str>,
    has_key: bool,
}

fn door() -> StateMachine<Door, Push, Trace> {
    let mut fsm = StateMachine::new(Door::Closed);
    fsm.add_state(
        Door::Closed,
        StateHandlers::new()
            .on_enter(|t: &mut Trace| t.calls.push("enter closed"))
            .on_exit(|t: &mut Trace| t.calls.push("exit closed")),
    );
    fsm.add_state(
        Door::Open,
        StateHandlers::new()
            .on_enter(|t: &mut Trace| t.calls.push("enter open"))
            .on_exit(|t: &mut Trace| t.calls.push("exit open")),
    );
    fsm.add_state(
        Door::Locked,
        StateHandlers::new().on_enter(|t: &mut Trace| t.calls.push("enter locked")),
    );

    fsm.add_transition(
        Transition::new(Door::Closed, Push::Open, Door::Open)
            .action(|t: &mut Trace| t.calls.push("swing")),
    );
    fsm.add_transition(Transition::new(Door::Open, Push::Close, Door::Closed));
    fsm.add_transition(
        Transition::new(Door::Closed, Push::Lock, Door::Locked).guard(|t: &Trace, _| t.has_key),
    );
    fsm
}

#[test]
fn test_exit_action_enter_ordering() {
    let mut fsm = door();
    let mut trace = Trace::default();

    assert_eq!(fsm.process_event(Push::Open, &mut trace), Ok(Door::Open));
    assert_eq!(trace.calls, vec!["exit closed", "swing", "enter open"]);
    assert_eq!(fsm.current_state(), Door::Open);
}

#[test]
fn test_unhandled_event_leaves_state() {
    let mut fsm = door();
    let mut trace = Trace::default();

    assert_eq!(
        fsm.process_event(Push::Close, &mut trace),
        Err(TransitionError::NoTransition {
            state: Door::Closed,
            event: Push::Close
        })
    );
    assert_eq!(fsm.current_state(), Door::Closed);
    assert!(trace.calls.is_empty());
    assert!(!fsm.can_handle(Push::Close));
}

#[test]
fn test_guard_rejection_runs_no_actions() {
    let mut fsm = door();
    let mut trace = Trace::default();

    assert_eq!(
        fsm.process_event(Push::Lock, &mut trace),
        Err(TransitionError::GuardRejected {
            state: Door::Closed,
            event: Push::Lock
        })
    );
    assert!(trace.calls.is_empty());
    assert_eq!(fsm.current_state(), Door::Closed);

    trace.has_key = true;
    assert_eq!(fsm.process_event(Push::Lock, &mut trace), Ok(Door::Locked));
    assert_eq!(trace.calls, vec!["exit closed", "enter locked"]);
}

#[test]
fn test_later_transition_replaces_earlier() {
    let mut fsm = door();
    let replaced = fsm.add_transition(Transition::new(Door::Closed, Push::Open, Door::Locked));
    assert!(replaced.is_some_and(|t| t.to == Door::Open));

    let mut trace = Trace::default();
    assert_eq!(fsm.process_event(Push::Open, &mut trace), Ok(Door::Locked));
}

// Controller transition table

fn controller_fsm() -> (StateMachine<SystemState, SystemEvent, Plant>, Plant) {
    let config = ControllerConfig::default();
    (build_state_machine(&config), Plant::new(&config))
}

#[test]
fn test_ignition_on_requires_coolant_level() {
    let (mut fsm, mut plant) = controller_fsm();
    plant.level_ok = false;

    assert!(matches!(
        fsm.process_event(SystemEvent::IgnitionOn, &mut plant),
        Err(TransitionError::GuardRejected { .. })
    ));
    assert_eq!(fsm.current_state(), SystemState::Off);
    assert!(!plant.pump_on());
    assert!(plant.deferred().pending().is_empty());

    plant.level_ok = true;
    assert_eq!(
        fsm.process_event(SystemEvent::IgnitionOn, &mut plant),
        Ok(SystemState::Initializing)
    );
    assert!(plant.pump_on());
    // Enter action ran exactly once: one priming event armed
    assert_eq!(plant.deferred().pending().len(), 1);
    assert_eq!(plant.deferred().get_stats().total_scheduled, 1);
}

#[test]
fn test_leaving_initializing_cancels_priming() {
    let (mut fsm, mut plant) = controller_fsm();
    fsm.process_event(SystemEvent::IgnitionOn, &mut plant).unwrap();

    assert_eq!(
        fsm.process_event(SystemEvent::IgnitionOff, &mut plant),
        Ok(SystemState::Off)
    );
    assert!(plant.deferred().pending().is_empty());
    assert!(!plant.pump_on());
}

#[test]
fn test_emergency_stop_outputs() {
    let (mut fsm, mut plant) = controller_fsm();
    fsm.process_event(SystemEvent::IgnitionOn, &mut plant).unwrap();
    fsm.process_event(SystemEvent::InitComplete, &mut plant).unwrap();
    assert_eq!(fsm.current_state(), SystemState::Running);

    assert_eq!(
        fsm.process_event(SystemEvent::CriticalTemp, &mut plant),
        Ok(SystemState::EmergencyStop)
    );
    assert!(!plant.pump_on());
    assert!(plant.fan_on());
    assert_eq!(plant.fan_speed(), 100);

    assert_eq!(
        fsm.process_event(SystemEvent::TempNormal, &mut plant),
        Ok(SystemState::Error)
    );
    assert!(!plant.pump_on());
    assert!(!plant.fan_on());
    assert_eq!(plant.fan_speed(), 0);
}

#[test]
fn test_error_cleared_requires_ignition() {
    let (mut fsm, mut plant) = controller_fsm();
    fsm.process_event(SystemEvent::IgnitionOn, &mut plant).unwrap();
    fsm.process_event(SystemEvent::LowCoolant, &mut plant).unwrap();
    assert_eq!(fsm.current_state(), SystemState::Error);

    plant.ignition = false;
    assert!(matches!(
        fsm.process_event(SystemEvent::ErrorCleared, &mut plant),
        Err(TransitionError::GuardRejected { .. })
    ));

    plant.ignition = true;
    assert_eq!(
        fsm.process_event(SystemEvent::ErrorCleared, &mut plant),
        Ok(SystemState::Initializing)
    );
}

#[test]
fn test_running_ignores_unrelated_events() {
    let (mut fsm, mut plant) = controller_fsm();
    fsm.process_event(SystemEvent::IgnitionOn, &mut plant).unwrap();
    fsm.process_event(SystemEvent::InitComplete, &mut plant).unwrap();

    for event in [SystemEvent::IgnitionOn, SystemEvent::TempNormal, SystemEvent::ErrorCleared] {
        assert!(matches!(
            fsm.process_event(event, &mut plant),
            Err(TransitionError::NoTransition { .. })
        ));
    }
    assert_eq!(fsm.current_state(), SystemState::Running);
}
