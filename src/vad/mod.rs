//! Voice activity detection
//!
//! Energy-based detector with an adaptive, clamped threshold and a
//! three-state hysteresis:
//! - Silence: no speech, noise floor is tracked
//! - Pending: energy crossed the threshold, not yet long enough to trust
//! - Speech: confirmed utterance in progress

mod config;
mod detector;

pub use config::VadConfig;
pub use detector::{VadState, VoiceActivityDetector};
