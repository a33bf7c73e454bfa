//! Messages consumed by the session control loop

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::audio::AudioFrame;
use crate::error::ServiceError;
use crate::services::{CompletionResponse, PlaybackOutcome, TranscriptSegment};
use crate::state::AgentState;
use crate::vad::VadState;

/// Everything the control loop reacts to, in arrival order.
///
/// Asynchronous results carry the epoch they were requested under; the
/// orchestrator applies them only while that epoch is still current.
#[derive(Debug)]
pub enum SessionEvent {
    /// Host asked to start listening
    Start,
    /// Host signalled attention before starting
    Wake,
    /// Host asked to end the session
    Stop,
    /// Stop the session and exit the control loop
    Shutdown,

    /// One captured microphone frame
    Frame(AudioFrame),

    /// Recognizer produced a result
    Transcript(TranscriptSegment),
    /// Recognizer failed
    RecognizerError(String),
    /// Recognizer stream ended on its own
    RecognizerEnded,

    /// Completion endpoint answered
    CompletionFinished {
        epoch: u64,
        result: Result<CompletionResponse, ServiceError>,
        /// Round trip measured around the call
        elapsed: Duration,
    },
    /// Playback task ended
    PlaybackFinished {
        epoch: u64,
        result: Result<PlaybackOutcome, ServiceError>,
    },

    /// Completion did not answer in time
    CompletionTimedOut { epoch: u64 },
    /// Post-playback settle delay elapsed
    SettleElapsed { epoch: u64 },
    /// Error cooldown elapsed
    CooldownElapsed { epoch: u64 },
    /// Recognizer restart delay elapsed
    RecognizerRestart { epoch: u64 },

    /// Snapshot request
    Status(oneshot::Sender<SessionStatus>),
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: AgentState,
    pub vad_state: VadState,
    pub epoch: u64,
    pub session_active: bool,
    pub playback_active: bool,
    /// Smoothed frame energy
    pub energy: f32,
    /// Energy of the last frame alone
    pub raw_energy: f32,
    pub threshold: f32,
    pub noise_floor: f32,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Idle,
            vad_state: VadState::Silence,
            epoch: 0,
            session_active: false,
            playback_active: false,
            energy: 0.0,
            raw_energy: 0.0,
            threshold: 0.0,
            noise_floor: 0.0,
        }
    }
}
