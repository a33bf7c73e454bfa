//! Conversation phase state machine
//!
//! Sole authority over the current phase:
//! - Idle: no session, microphone released
//! - Wake: host signalled attention, capture about to start
//! - Listening: capturing the user's utterance
//! - Thinking: waiting on the completion endpoint
//! - Speaking: playing the synthesized response, barge-in allowed
//! - Error: a collaborator failed, recovery pending

mod machine;

pub use machine::{AgentState, AgentStateMachine, TransitionRecord};
