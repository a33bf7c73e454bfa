//! Contracts for the external collaborators
//!
//! Speech recognition, completion and speech output are services outside
//! the core. The orchestrator depends only on these traits; concrete
//! implementations are injected at session construction (the daemon wires
//! IPC-backed ones, tests wire mocks).

mod playback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::session::RecognizerSink;

pub use playback::PlaybackSession;

/// One recognizer result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptSegment {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Request to the completion endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub text: String,
    /// Session epoch the request was issued under
    pub epoch: u64,
}

/// Answer from the completion endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub latency_ms: u64,
}

/// Text to synthesize and play
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
}

/// How a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackOutcome {
    /// All audio was played
    Completed,
    /// Stopped early through the cancellation token
    Cancelled,
}

/// Streaming speech-to-text source.
///
/// Results, errors and end-of-stream notices are reported through the
/// sink, which serializes them onto the session's event queue.
pub trait SpeechRecognizer: Send + Sync {
    /// Begin (or resume) recognition
    fn start(&self, sink: RecognizerSink) -> Result<(), ServiceError>;

    /// Stop recognition; calling it while stopped is a no-op
    fn stop(&self);
}

/// Text completion endpoint. No retries happen at this layer.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ServiceError>;
}

/// Speech synthesis plus playback on the output device.
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Play `request` to completion.
    ///
    /// Implementations must stop producing audio as soon as `cancel` fires
    /// and then return `PlaybackOutcome::Cancelled`.
    async fn play(
        &self,
        request: SpeechRequest,
        cancel: CancellationToken,
    ) -> Result<PlaybackOutcome, ServiceError>;
}
