//! Detector tuning parameters

use std::time::Duration;

use crate::error::{TurnError, TurnResult};

/// Configuration for the voice activity detector.
///
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Sample rate of incoming frames (default: 16000 Hz)
    pub sample_rate: u32,

    /// Threshold used before any noise has been observed
    pub initial_threshold: f32,

    /// Lower clamp for the adaptive threshold
    pub min_threshold: f32,

    /// Upper clamp for the adaptive threshold
    pub max_threshold: f32,

    /// Continuous silence that ends an utterance (default: 800ms)
    pub silence_timeout_ms: u64,

    /// Sustained energy needed to confirm speech (default: 300ms)
    pub min_speech_duration_ms: u64,

    /// Fraction of the distance to the target threshold covered per frame
    pub adaptation_rate: f32,

    /// Number of frames averaged into the smoothed energy
    pub smoothing_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            initial_threshold: 0.02,
            min_threshold: 0.005,
            max_threshold: 0.3,
            silence_timeout_ms: 800,
            min_speech_duration_ms: 300,
            adaptation_rate: 0.05,
            smoothing_frames: 5,
        }
    }
}

impl VadConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn min_speech_duration(&self) -> Duration {
        Duration::from_millis(self.min_speech_duration_ms)
    }

    /// Reject parameter combinations the detector cannot honour
    pub fn validate(&self) -> TurnResult<()> {
        if self.sample_rate == 0 {
            return Err(TurnError::Config("VAD sample rate must be positive".into()));
        }
        if self.smoothing_frames == 0 {
            return Err(TurnError::Config("VAD smoothing window must hold at least one frame".into()));
        }
        if !(self.min_threshold.is_finite() && self.max_threshold.is_finite()) || self.min_threshold < 0.0 {
            return Err(TurnError::Config("VAD thresholds must be finite and non-negative".into()));
        }
        if self.min_threshold > self.max_threshold {
            return Err(TurnError::Config(format!(
                "VAD min threshold {} exceeds max threshold {}",
                self.min_threshold, self.max_threshold
            )));
        }
        if !(self.adaptation_rate > 0.0 && self.adaptation_rate <= 1.0) {
            return Err(TurnError::Config(format!(
                "VAD adaptation rate must be in (0, 1], got {}",
                self.adaptation_rate
            )));
        }
        Ok(())
    }
}
