//! Table-driven finite state machine with guarded transitions.
//!
//! ```text
//!   (state, event) ──lookup──► Transition { to, guard, action }
//!
//!   process_event:
//!     no entry        -> Err(NoTransition), nothing runs
//!     guard == false  -> Err(GuardRejected), nothing runs
//!     otherwise       -> exit(from) -> action -> state = to -> enter(to)
//! ```
//!
//! The machine is generic over the state and event enums and over a context
//! type `C`. Handlers receive the context instead of the machine, so an
//! enter/exit action or guard can never re-enter `process_event` on the
//! machine that is running it. Callers that share a machine between threads
//! wrap the machine together with its context in one lock.

use core::fmt::Debug;
use core::hash::Hash;
use std::collections::HashMap;
use thiserror::Error;

/// Enter/exit/transition side effect.
pub type Action<C> = Box<dyn Fn(&mut C) + Send>;

/// Transition predicate. Sees the context read-only.
pub type Guard<C, E> = Box<dyn Fn(&C, &E) -> bool + Send>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError<S: Debug, E: Debug> {
    #[error("no transition from {state:?} on {event:?}")]
    NoTransition { state: S, event: E },

    #[error("guard rejected {event:?} in {state:?}")]
    GuardRejected { state: S, event: E },
}

pub struct StateHandlers<C> {
    on_enter: Option<Action<C>>,
    on_exit: Option<Action<C>>,
}

impl<C> StateHandlers<C> {
    pub fn new() -> Self {
        Self {
            on_enter: None,
            on_exit: None,
        }
    }

    pub fn on_enter(mut self, action: impl Fn(&mut C) + Send + 'static) -> Self {
        self.on_enter = Some(Box::new(action));
        self
    }

    pub fn on_exit(mut self, action: impl Fn(&mut C) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(action));
        self
    }
}

impl<C> Default for StateHandlers<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Transition<S, E, C> {
    pub from: S,
    pub event: E,
    pub to: S,
    guard: Option<Guard<C, E>>,
    action: Option<Action<C>>,
}

impl<S, E, C> Transition<S, E, C> {
    pub fn new(from: S, event: E, to: S) -> Self {
        Self {
            from,
            event,
            to,
            guard: None,
            action: None,
        }
    }

    pub fn guard(mut self, guard: impl Fn(&C, &E) -> bool + Send + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn action(mut self, action: impl Fn(&mut C) + Send + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }
}

pub struct StateMachine<S, E, C> {
    current: S,
    states: HashMap<S, StateHandlers<C>>,
    transitions: HashMap<(S, E), Transition<S, E, C>>,
}

impl<S, E, C> StateMachine<S, E, C>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    /// New machine in `initial`. The initial state's enter action is not run.
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            states: HashMap::new(),
            transitions: HashMap::new(),
        }
    }

    /// Register handlers for `state`, replacing any previous registration.
    pub fn add_state(&mut self, state: S, handlers: StateHandlers<C>) {
        self.states.insert(state, handlers);
    }

    /// Register a transition. A second transition for the same
    /// `(from, event)` pair replaces the first, which is returned.
    pub fn add_transition(&mut self, transition: Transition<S, E, C>) -> Option<Transition<S, E, C>> {
        self.transitions
            .insert((transition.from, transition.event), transition)
    }

    /// Feed `event` to the machine. Returns the new state on success.
    pub fn process_event(&mut self, event: E, ctx: &mut C) -> Result<S, TransitionError<S, E>> {
        let from = self.current;
        let transition = self
            .transitions
            .get(&(from, event))
            .ok_or(TransitionError::NoTransition { state: from, event })?;

        if let Some(guard) = &transition.guard {
            if !guard(ctx, &event) {
                return Err(TransitionError::GuardRejected { state: from, event });
            }
        }

        if let Some(exit) = self.states.get(&from).and_then(|h| h.on_exit.as_ref()) {
            exit(ctx);
        }

        if let Some(action) = &transition.action {
            action(ctx);
        }

        let to = transition.to;
        self.current = to;

        if let Some(enter) = self.states.get(&to).and_then(|h| h.on_enter.as_ref()) {
            enter(ctx);
        }

        Ok(to)
    }

    pub fn current_state(&self) -> S {
        self.current
    }

    /// Whether a transition is registered for `event` in the current state.
    /// Guards are not evaluated.
    pub fn can_handle(&self, event: E) -> bool {
        self.transitions.contains_key(&(self.current, event))
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }
}
