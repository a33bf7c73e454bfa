//! voice-turn: turn-taking core for a voice conversation agent
//!
//! Provides:
//! - Adaptive, hysteretic voice activity detection over PCM frames
//! - Explicit state machine for the conversation phase
//! - Session orchestration with barge-in and stale-response rejection
//! - IPC server through which a host supplies recognition, completion
//!   and playback

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod lifecycle;
pub mod services;
pub mod session;
pub mod state;
pub mod vad;
