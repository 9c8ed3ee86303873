//! Finite-state machine engine
//!
//! Every stateful component of the delivery core (transport adapters, packet
//! deliveries, proxy roles) is an [`Automat`] driven by one cooperative event
//! loop owned by a [`Runtime`]. Machines declare a closed `State` enum and a
//! closed `Event` enum; the transition table is the `match` inside
//! [`Machine::transition`].

mod machine;
mod runtime;

pub use machine::{Automat, Context, ObserverId};
pub use runtime::{InstanceInfo, Runtime, StateChange, Task};

use std::fmt;
use std::time::Duration;

/// Behaviour of one state machine family.
pub trait Machine: Sized + Send + 'static {
    type State: Copy + Eq + fmt::Debug + Send + Sync + 'static;
    type Event: fmt::Debug + Send + 'static;

    /// Timers of this instance. Called once when the automat is built.
    fn timers(&self) -> Vec<TimerSpec<Self>> {
        Vec::new()
    }

    /// Handle `event` in `state`, run the actions and return the new state.
    fn transition(
        &mut self,
        ctx: &mut Context<'_, Self>,
        state: Self::State,
        event: Self::Event,
    ) -> Self::State;

    fn state_changed(&mut self, _ctx: &mut Context<'_, Self>, _old: Self::State, _new: Self::State) {}

    fn state_not_changed(&mut self, _ctx: &mut Context<'_, Self>, _state: Self::State) {}
}

/// A named repeating timer armed only while the machine sits in one of `states`.
pub struct TimerSpec<M: Machine> {
    pub name: &'static str,
    pub interval: Duration,
    pub states: Vec<M::State>,
    pub event: fn() -> M::Event,
}

impl<M: Machine> TimerSpec<M> {
    pub fn new(
        name: &'static str,
        interval: Duration,
        states: &[M::State],
        event: fn() -> M::Event,
    ) -> Self {
        Self {
            name,
            interval,
            states: states.to_vec(),
            event,
        }
    }

    pub fn armed_in(&self, state: M::State) -> bool {
        self.states.contains(&state)
    }
}

impl<M: Machine> fmt::Debug for TimerSpec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSpec")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("states", &self.states)
            .finish()
    }
}

/// Selects which transitions a state observer is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFilter<S> {
    pub old: Option<S>,
    pub new: Option<S>,
}

impl<S: Copy + PartialEq> StateFilter<S> {
    /// Every state change.
    pub fn any() -> Self {
        Self {
            old: None,
            new: None,
        }
    }

    pub fn entering(state: S) -> Self {
        Self {
            old: None,
            new: Some(state),
        }
    }

    pub fn leaving(state: S) -> Self {
        Self {
            old: Some(state),
            new: None,
        }
    }

    pub fn between(old: S, new: S) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn matches(&self, old: S, new: S) -> bool {
        self.old.map_or(true, |s| s == old) && self.new.map_or(true, |s| s == new)
    }
}
