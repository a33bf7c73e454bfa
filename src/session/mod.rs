//! Turn-taking session
//!
//! All inputs (microphone frames, recognizer results, network completions,
//! timers, host commands) are messages on one ordered queue consumed by a
//! single control loop. The orchestrator is the only writer of the phase
//! state machine, so no locks guard the conversation phase.

mod event;
mod handle;
mod orchestrator;
mod speech;

pub use event::{SessionEvent, SessionStatus};
pub use handle::{RecognizerSink, SessionHandle};
pub use orchestrator::{AudioDevices, Collaborators, Orchestrator, SessionConfig};
pub use speech::clean_for_speech;
