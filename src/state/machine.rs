//! Core state machine implementation
//!
//! Validates every requested phase change against a fixed adjacency set.
//! The machine performs no I/O: callers gate their own side effects
//! (capture, playback, cancellation) on the boolean it returns.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::StateEvent;

/// Number of committed transitions kept for auditing
const HISTORY_LIMIT: usize = 64;

/// The six conversation phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// No session, nothing captured
    Idle,
    /// Attention signalled, about to listen
    Wake,
    /// Capturing the user's utterance
    Listening,
    /// Waiting on the completion endpoint
    Thinking,
    /// Playing the synthesized response
    Speaking,
    /// A collaborator failed; recovery pending
    Error,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Idle => write!(f, "Idle"),
            AgentState::Wake => write!(f, "Wake"),
            AgentState::Listening => write!(f, "Listening"),
            AgentState::Thinking => write!(f, "Thinking"),
            AgentState::Speaking => write!(f, "Speaking"),
            AgentState::Error => write!(f, "Error"),
        }
    }
}

impl AgentState {
    /// Whether `self -> target` is in the legal adjacency set
    pub fn can_transition_to(self, target: AgentState) -> bool {
        use AgentState::*;

        match (self, target) {
            // Failure and explicit stop are reachable from anywhere
            (_, Error) | (_, Idle) => true,
            (Idle, Wake) | (Idle, Listening) | (Wake, Listening) => true,
            (Listening, Thinking) => true,
            (Thinking, Speaking) => true,
            // Normal completion or barge-in; the reason tells them apart
            (Speaking, Listening) => true,
            _ => false,
        }
    }
}

/// One committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub to: AgentState,
    pub reason: String,
    /// Milliseconds since the machine was created
    pub at_ms: u64,
}

/// The state machine that owns the conversation phase
pub struct AgentStateMachine {
    /// Current state
    state: AgentState,
    /// When the current state was entered
    state_entered_at: Instant,
    created_at: Instant,
    history: VecDeque<TransitionRecord>,
    /// Channel for emitting state events
    event_tx: broadcast::Sender<StateEvent>,
}

impl AgentStateMachine {
    /// Create a new state machine in Idle
    pub fn new(event_tx: broadcast::Sender<StateEvent>) -> Self {
        let now = Instant::now();
        Self {
            state: AgentState::Idle,
            state_entered_at: now,
            created_at: now,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            event_tx,
        }
    }

    /// Get the current state
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Barge-in is only meaningful while a response is playing
    pub fn can_barge_in(&self) -> bool {
        self.state == AgentState::Speaking
    }

    /// Most recent committed transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Request a phase change.
    ///
    /// Returns false and leaves the state untouched if the edge is not
    /// legal. Rejections are expected races (barge-in versus a late
    /// response), so they are logged at warn and never treated as errors.
    pub fn transition(&mut self, target: AgentState, reason: &str) -> bool {
        if !self.state.can_transition_to(target) {
            warn!(
                from = %self.state,
                to = %target,
                reason,
                "transition rejected"
            );
            let _ = self.event_tx.send(StateEvent::TransitionRejected {
                from: self.state,
                to: target,
                reason: reason.to_string(),
            });
            return false;
        }

        self.commit(target, reason);
        true
    }

    /// Force Idle regardless of the current phase. Always succeeds.
    pub fn reset(&mut self, reason: &str) {
        self.commit(AgentState::Idle, reason);
    }

    /// Perform a state transition
    fn commit(&mut self, target: AgentState, reason: &str) {
        let from = self.state;
        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;

        info!(
            from = %from,
            to = %target,
            reason,
            duration_ms,
            "state transition"
        );

        self.state = target;
        self.state_entered_at = Instant::now();

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to: target,
            reason: reason.to_string(),
            at_ms: self.created_at.elapsed().as_millis() as u64,
        });

        let event = StateEvent::StateChanged {
            from,
            to: target,
            reason: reason.to_string(),
            duration_ms,
        };
        debug!(?event, "emitting transition event");
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [AgentState; 6] = [
        AgentState::Idle,
        AgentState::Wake,
        AgentState::Listening,
        AgentState::Thinking,
        AgentState::Speaking,
        AgentState::Error,
    ];

    fn create_state_machine() -> (AgentStateMachine, broadcast::Receiver<StateEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (AgentStateMachine::new(tx), rx)
    }

    /// Drive a fresh machine into `target` along legal edges
    fn machine_in(target: AgentState) -> AgentStateMachine {
        let (mut sm, _) = create_state_machine();
        let path: &[AgentState] = match target {
            AgentState::Idle => &[],
            AgentState::Wake => &[AgentState::Wake],
            AgentState::Listening => &[AgentState::Listening],
            AgentState::Thinking => &[AgentState::Listening, AgentState::Thinking],
            AgentState::Speaking => &[AgentState::Listening, AgentState::Thinking, AgentState::Speaking],
            AgentState::Error => &[AgentState::Error],
        };
        for &step in path {
            assert!(sm.transition(step, "setup"));
        }
        assert_eq!(sm.state(), target);
        sm
    }

    #[test]
    fn test_initial_state() {
        let (sm, _) = create_state_machine();
        assert_eq!(sm.state(), AgentState::Idle);
        assert!(!sm.can_barge_in());
    }

    #[test]
    fn test_full_turn_cycle() {
        let (mut sm, _) = create_state_machine();
        assert!(sm.transition(AgentState::Listening, "session started"));
        assert!(sm.transition(AgentState::Thinking, "utterance complete"));
        assert!(sm.transition(AgentState::Speaking, "response ready"));
        assert!(sm.transition(AgentState::Listening, "playback complete"));
        assert_eq!(sm.state(), AgentState::Listening);
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        let (mut sm, mut rx) = create_state_machine();
        assert!(!sm.transition(AgentState::Speaking, "skip ahead"));
        assert_eq!(sm.state(), AgentState::Idle);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            StateEvent::TransitionRejected {
                from: AgentState::Idle,
                to: AgentState::Speaking,
                ..
            }
        ));
    }

    #[test]
    fn test_thinking_cannot_return_to_listening() {
        let mut sm = machine_in(AgentState::Thinking);
        assert!(!sm.transition(AgentState::Listening, "barge-in"));
        assert_eq!(sm.state(), AgentState::Thinking);
    }

    #[test]
    fn test_error_and_idle_reachable_from_everywhere() {
        for from in ALL {
            let mut sm = machine_in(from);
            assert!(sm.transition(AgentState::Error, "boom"), "{from} -> Error");
            let mut sm = machine_in(from);
            assert!(sm.transition(AgentState::Idle, "stop"), "{from} -> Idle");
        }
    }

    #[test]
    fn test_error_only_leaves_to_idle() {
        for to in ALL {
            let legal = matches!(to, AgentState::Idle | AgentState::Error);
            let mut sm = machine_in(AgentState::Error);
            assert_eq!(sm.transition(to, "probe"), legal, "Error -> {to}");
        }
    }

    #[test]
    fn test_barge_in_only_while_speaking() {
        for state in ALL {
            let sm = machine_in(state);
            assert_eq!(sm.can_barge_in(), state == AgentState::Speaking, "{state}");
        }
    }

    #[test]
    fn test_reset_always_yields_idle() {
        for state in ALL {
            let mut sm = machine_in(state);
            sm.reset("Error recovery");
            assert_eq!(sm.state(), AgentState::Idle);
        }
    }

    #[test]
    fn test_transition_events_carry_reason() {
        let (mut sm, mut rx) = create_state_machine();
        sm.transition(AgentState::Listening, "session started");

        match rx.try_recv().unwrap() {
            StateEvent::StateChanged { from, to, reason, .. } => {
                assert_eq!(from, AgentState::Idle);
                assert_eq!(to, AgentState::Listening);
                assert_eq!(reason, "session started");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let (mut sm, _) = create_state_machine();
        for i in 0..100 {
            sm.transition(AgentState::Listening, &format!("listen {i}"));
            sm.reset("stop");
        }
        let history: Vec<_> = sm.history().collect();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().reason, "stop");
        assert_eq!(history.last().unwrap().to, AgentState::Idle);
    }
}
