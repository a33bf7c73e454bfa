//! Events module for phase transitions and turn-taking milestones
//!
//! Every event is broadcast to in-process listeners and, through the IPC
//! server, to subscribed host clients. Transition events double as the
//! audit trail: each one carries the reason it was requested with.

use serde::{Deserialize, Serialize};

use crate::state::AgentState;

/// Events emitted by the state machine and the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// A legal transition was committed
    StateChanged {
        from: AgentState,
        to: AgentState,
        reason: String,
        /// Time spent in the phase being left
        duration_ms: u64,
    },

    /// A transition was requested from a phase that does not allow it
    TransitionRejected {
        from: AgentState,
        to: AgentState,
        reason: String,
    },

    /// The detector confirmed speech
    SpeechStarted,

    /// The detector saw the end of an utterance
    SpeechEnded,

    /// A final transcript was accepted for processing
    UtteranceFinalized { epoch: u64, text: String },

    /// The completion endpoint answered for the current epoch
    ResponseReady {
        epoch: u64,
        /// Round trip measured by the orchestrator
        latency_ms: u64,
        /// Latency reported by the endpoint itself
        endpoint_latency_ms: u64,
    },

    /// Synthesized speech started playing
    PlaybackStarted { epoch: u64 },

    /// Synthesized speech played to the end
    PlaybackFinished { epoch: u64 },

    /// The user interrupted playback
    BargeIn { epoch: u64 },

    /// A response from an abandoned request was dropped
    StaleResponseDiscarded { epoch: u64, current_epoch: u64 },

    /// Microphone capture started
    AudioCaptureStarted,

    /// Microphone capture stopped and the device was released
    AudioCaptureStopped,
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::StateChanged { from, to, reason, .. } => {
                write!(f, "STATE_CHANGED ({} -> {}: {})", from, to, reason)
            }
            StateEvent::TransitionRejected { from, to, .. } => {
                write!(f, "TRANSITION_REJECTED ({} -> {})", from, to)
            }
            StateEvent::SpeechStarted => write!(f, "SPEECH_STARTED"),
            StateEvent::SpeechEnded => write!(f, "SPEECH_ENDED"),
            StateEvent::UtteranceFinalized { epoch, .. } => {
                write!(f, "UTTERANCE_FINALIZED (epoch {})", epoch)
            }
            StateEvent::ResponseReady { latency_ms, .. } => {
                write!(f, "RESPONSE_READY ({}ms)", latency_ms)
            }
            StateEvent::PlaybackStarted { epoch } => write!(f, "PLAYBACK_STARTED (epoch {})", epoch),
            StateEvent::PlaybackFinished { epoch } => write!(f, "PLAYBACK_FINISHED (epoch {})", epoch),
            StateEvent::BargeIn { epoch } => write!(f, "BARGE_IN (epoch {})", epoch),
            StateEvent::StaleResponseDiscarded { epoch, current_epoch } => {
                write!(f, "STALE_RESPONSE_DISCARDED (epoch {} != {})", epoch, current_epoch)
            }
            StateEvent::AudioCaptureStarted => write!(f, "AUDIO_CAPTURE_STARTED"),
            StateEvent::AudioCaptureStopped => write!(f, "AUDIO_CAPTURE_STOPPED"),
        }
    }
}
