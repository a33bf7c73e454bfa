//! Error types for the turn-taking core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for library operations
pub type TurnResult<T> = Result<T, TurnError>;

/// Failures reported by external collaborators (STT, completion, TTS/playback).
///
/// These travel through the session event queue, so they are `Clone` and
/// serializable rather than wrapping source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ServiceError {
    #[error("speech recognition failed: {0}")]
    Stt(String),

    #[error("completion failed: {0}")]
    Completion(String),

    #[error("speech synthesis failed: {0}")]
    Tts(String),

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("collaborator disconnected: {0}")]
    Disconnected(String),
}

/// Errors returned by library operations
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("audio device busy: {0}")]
    DeviceBusy(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
