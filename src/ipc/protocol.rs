//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::StateEvent;
use crate::session::SessionStatus;

/// Requests from host to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current daemon status
    GetStatus,

    /// Subscribe to state events and collaborator requests
    Subscribe,

    /// Start listening
    StartSession,

    /// End the session and release the microphone
    StopSession,

    /// Signal attention before starting
    Wake,

    /// One captured microphone frame
    AudioFrame {
        samples: Vec<f32>,
        /// Offset of the first sample from capture start
        timestamp_ms: u64,
    },

    /// Recognizer output
    Transcript { text: String, is_final: bool },

    /// Recognizer failure
    RecognizerError { message: String },

    /// Recognizer stream ended on its own
    RecognizerEnded,

    /// Answer to a `completion_requested` notification
    CompletionResult {
        request_id: u64,
        #[serde(default)]
        text: String,
        #[serde(default)]
        latency_ms: u64,
        #[serde(default)]
        error: Option<String>,
    },

    /// Answer to a `playback_requested` notification
    PlaybackFinished {
        request_id: u64,
        #[serde(default)]
        cancelled: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Responses from daemon to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Pong response to ping
    Pong,

    /// Current daemon status
    Status(DaemonStatus),

    /// Subscription confirmed
    Subscribed,

    /// Request queued for the session
    Accepted,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to subscribed hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// State event occurred
    StateEvent { event: StateEvent },

    /// Start or stop the recognizer
    RecognizerControl { active: bool },

    /// Run a completion and answer with `completion_result`
    CompletionRequested { request_id: u64, epoch: u64, text: String },

    /// Synthesize and play, then answer with `playback_finished`
    PlaybackRequested {
        request_id: u64,
        text: String,
        voice: String,
    },

    /// Stop the given playback immediately
    PlaybackCancelled { request_id: u64 },
}

/// Everything written to a client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Outbound {
    Response(Response),
    Notification(Notification),
}

/// Full daemon status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Uptime in seconds
    pub uptime_secs: u64,

    /// Current session view
    pub session: SessionStatus,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: 0,
            session: SessionStatus::default(),
        }
    }
}
