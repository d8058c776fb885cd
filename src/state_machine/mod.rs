//! # Declarative State Machines
//!
//! Each entity owns a [`StateMachine`]: a current state plus a table of
//! transitions `{verb, from-states -> to-state}`. `can` is a pure predicate;
//! `fire` commits the transition or reports why it cannot. A transition
//! whose target equals the current state yields the [`StateMachineError::NoTransition`]
//! sentinel, which callers treat as success (idempotent re-entry).
//!
//! Callbacks are not part of the machine itself: entities run their
//! verb-keyed callback between `can` and `fire`, holding the entity lock,
//! which makes the no-reentry rule structural.

pub mod states;

use std::fmt::Display;

use thiserror::Error;

pub use states::{ApplicationState, NodeState, SchedulerState, TaskState};

/// One row of a transition table.
#[derive(Debug)]
pub struct Transition<S: 'static, V: 'static> {
    pub verb: V,
    pub from: &'static [S],
    pub to: S,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    /// Same-state re-entry; treated as success by callers.
    #[error("no transition")]
    NoTransition,
    #[error("event {verb} inappropriate in current state {state}")]
    InvalidTransition { state: String, verb: String },
}

#[derive(Debug)]
pub struct StateMachine<S: 'static, V: 'static> {
    current: S,
    transitions: &'static [Transition<S, V>],
}

impl<S, V> StateMachine<S, V>
where
    S: Copy + PartialEq + Display,
    V: Copy + PartialEq + Display,
{
    pub fn new(initial: S, transitions: &'static [Transition<S, V>]) -> Self {
        Self {
            current: initial,
            transitions,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// The state `verb` would lead to from the current state, if defined.
    pub fn target(&self, verb: V) -> Option<S> {
        self.transitions
            .iter()
            .find(|t| t.verb == verb && t.from.contains(&self.current))
            .map(|t| t.to)
    }

    /// Pure predicate: is `verb` legal in the current state?
    pub fn can(&self, verb: V) -> bool {
        self.target(verb).is_some()
    }

    /// Commit the transition for `verb`.
    ///
    /// Returns the new state, `NoTransition` for a same-state re-entry
    /// (state unchanged, callers treat as success), or `InvalidTransition`
    /// leaving the state untouched.
    pub fn fire(&mut self, verb: V) -> Result<S, StateMachineError> {
        match self.target(verb) {
            None => Err(StateMachineError::InvalidTransition {
                state: self.current.to_string(),
                verb: verb.to_string(),
            }),
            Some(to) if to == self.current => Err(StateMachineError::NoTransition),
            Some(to) => {
                self.current = to;
                Ok(to)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TaskVerb;
    use proptest::prelude::*;

    static TEST_TRANSITIONS: &[Transition<TaskState, TaskVerb>] = &[
        Transition {
            verb: TaskVerb::Init,
            from: &[TaskState::New],
            to: TaskState::Pending,
        },
        Transition {
            verb: TaskVerb::Schedule,
            from: &[TaskState::Pending],
            to: TaskState::Scheduling,
        },
        Transition {
            verb: TaskVerb::Fail,
            from: &[
                TaskState::New,
                TaskState::Pending,
                TaskState::Scheduling,
                TaskState::Allocated,
                TaskState::Bound,
            ],
            to: TaskState::Failed,
        },
    ];

    #[test]
    fn fire_follows_the_table() {
        let mut sm = StateMachine::new(TaskState::New, TEST_TRANSITIONS);
        assert!(sm.can(TaskVerb::Init));
        assert!(!sm.can(TaskVerb::Schedule));

        assert_eq!(sm.fire(TaskVerb::Init).unwrap(), TaskState::Pending);
        assert_eq!(sm.fire(TaskVerb::Schedule).unwrap(), TaskState::Scheduling);
    }

    #[test]
    fn invalid_transition_leaves_state_unchanged() {
        let mut sm = StateMachine::new(TaskState::New, TEST_TRANSITIONS);
        let err = sm.fire(TaskVerb::Schedule).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(sm.current(), TaskState::New);
    }

    proptest! {
        /// Totality: for every (state, verb) pair either the transition is
        /// defined and lands in the declared target, or `can` is false and
        /// `fire` leaves the state untouched.
        #[test]
        fn fire_is_total(state_idx in 0usize..8, verb_idx in 0usize..3) {
            let states = [
                TaskState::New,
                TaskState::Pending,
                TaskState::Scheduling,
                TaskState::Allocated,
                TaskState::Bound,
                TaskState::Rejected,
                TaskState::Completed,
                TaskState::Failed,
            ];
            let verbs = [TaskVerb::Init, TaskVerb::Schedule, TaskVerb::Fail];
            let state = states[state_idx];
            let verb = verbs[verb_idx];

            let mut sm = StateMachine::new(state, TEST_TRANSITIONS);
            if sm.can(verb) {
                let target = sm.target(verb).unwrap();
                match sm.fire(verb) {
                    Ok(new_state) => prop_assert_eq!(new_state, target),
                    Err(StateMachineError::NoTransition) => prop_assert_eq!(state, target),
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
            } else {
                prop_assert!(sm.fire(verb).is_err());
                prop_assert_eq!(sm.current(), state);
            }
        }
    }
}
