//! Adaptive energy detector with hysteresis
//!
//! Each frame runs the same fixed pipeline: RMS energy, moving-average
//! smoothing, noise-floor tracking (only while silent), threshold
//! adaptation, and finally one step of the Silence/Pending/Speech machine.
//! Processing is synchronous and allocation-free after construction so it
//! fits inside one frame period.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::audio::{rms, AudioFrame};

use super::config::VadConfig;

/// Weight kept by the noise floor on every silent frame
const NOISE_FLOOR_RETENTION: f32 = 0.95;

/// Speech must exceed the noise floor by this factor
const NOISE_MULTIPLIER: f32 = 2.5;

/// Classification of the most recent frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadState {
    /// No speech; the noise floor follows the input
    Silence,
    /// Energy above threshold for less than the minimum speech duration
    Pending,
    /// Confirmed speech
    Speech,
}

impl Default for VadState {
    fn default() -> Self {
        Self::Silence
    }
}

impl fmt::Display for VadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VadState::Silence => write!(f, "Silence"),
            VadState::Pending => write!(f, "Pending"),
            VadState::Speech => write!(f, "Speech"),
        }
    }
}

/// Per-session voice activity detector
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,

    /// Recent raw energies for smoothing
    window: VecDeque<f32>,
    raw_energy: f32,
    smoothed_energy: f32,

    noise_floor: f32,
    threshold: f32,

    speech_start: Option<Duration>,
    silence_start: Option<Duration>,
}

impl VoiceActivityDetector {
    /// Create a detector. Out-of-range settings are clamped rather than
    /// rejected; use `VadConfig::validate` to fail fast at load time.
    pub fn new(config: VadConfig) -> Self {
        let capacity = config.smoothing_frames.max(1);
        let mut detector = Self {
            config,
            state: VadState::Silence,
            window: VecDeque::with_capacity(capacity),
            raw_energy: 0.0,
            smoothed_energy: 0.0,
            noise_floor: 0.0,
            threshold: 0.0,
            speech_start: None,
            silence_start: None,
        };
        detector.reset();
        detector
    }

    /// Classify one frame, using its timestamp as the clock
    pub fn process(&mut self, frame: &AudioFrame) -> VadState {
        self.process_samples(&frame.samples, frame.timestamp)
    }

    /// Classify raw samples observed at `now`.
    ///
    /// Never fails. An empty buffer is discarded without touching the
    /// window, noise statistics or timers; non-finite samples are skipped.
    pub fn process_samples(&mut self, samples: &[f32], now: Duration) -> VadState {
        if samples.is_empty() {
            trace!("empty frame discarded");
            return self.state;
        }

        let energy = rms(samples);
        self.raw_energy = energy;

        if self.window.len() >= self.smoothing_frames() {
            self.window.pop_front();
        }
        self.window.push_back(energy);
        self.smoothed_energy = self.window.iter().sum::<f32>() / self.window.len() as f32;

        if self.state == VadState::Silence {
            self.noise_floor = self.noise_floor * NOISE_FLOOR_RETENTION + energy * (1.0 - NOISE_FLOOR_RETENTION);
        }

        let target = self.clamp_threshold(self.noise_floor * NOISE_MULTIPLIER);
        let rate = self.config.adaptation_rate.clamp(0.0, 1.0);
        self.threshold = self.clamp_threshold(self.threshold * (1.0 - rate) + target * rate);

        let is_speech = self.smoothed_energy > self.threshold;
        trace!(
            energy = self.smoothed_energy,
            threshold = self.threshold,
            noise_floor = self.noise_floor,
            is_speech,
            "vad frame"
        );

        self.step(is_speech, now);
        self.state
    }

    /// Advance the hysteresis machine by one frame
    fn step(&mut self, is_speech: bool, now: Duration) {
        match self.state {
            VadState::Silence => {
                if is_speech {
                    self.speech_start = Some(now);
                    self.enter(VadState::Pending);
                }
            }
            VadState::Pending => {
                if !is_speech {
                    // Too short to be speech: a click, pop or cough
                    self.speech_start = None;
                    self.enter(VadState::Silence);
                } else {
                    let start = *self.speech_start.get_or_insert(now);
                    if now.saturating_sub(start) >= self.config.min_speech_duration() {
                        self.enter(VadState::Speech);
                    }
                }
            }
            VadState::Speech => {
                if is_speech {
                    self.silence_start = None;
                } else {
                    let start = *self.silence_start.get_or_insert(now);
                    if now.saturating_sub(start) >= self.config.silence_timeout() {
                        self.speech_start = None;
                        self.silence_start = None;
                        self.enter(VadState::Silence);
                    }
                }
            }
        }
    }

    fn enter(&mut self, next: VadState) {
        debug!(
            from = %self.state,
            to = %next,
            energy = self.smoothed_energy,
            threshold = self.threshold,
            "vad state change"
        );
        self.state = next;
    }

    fn smoothing_frames(&self) -> usize {
        self.config.smoothing_frames.max(1)
    }

    fn clamp_threshold(&self, value: f32) -> f32 {
        let lo = self.config.min_threshold;
        let hi = self.config.max_threshold.max(lo);
        if value.is_nan() {
            return lo;
        }
        value.clamp(lo, hi)
    }

    /// Current classification
    pub fn state(&self) -> VadState {
        self.state
    }

    /// True while speech is tentative or confirmed
    pub fn is_speech_active(&self) -> bool {
        matches!(self.state, VadState::Pending | VadState::Speech)
    }

    /// Smoothed energy of the most recent frames
    pub fn energy_level(&self) -> f32 {
        self.smoothed_energy
    }

    /// Unsmoothed energy of the most recent frame
    pub fn raw_energy(&self) -> f32 {
        self.raw_energy
    }

    /// Current adaptive threshold, always within the configured clamp
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Force a state from outside, e.g. after playback echo cancellation.
    ///
    /// Timers restart from the next processed frame.
    pub fn set_state(&mut self, state: VadState) {
        if state != self.state {
            self.enter(state);
        }
        self.speech_start = None;
        self.silence_start = None;
    }

    /// Return to the initial Silence state with fresh noise statistics
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.window.clear();
        self.raw_energy = 0.0;
        self.smoothed_energy = 0.0;
        self.threshold = self.clamp_threshold(self.config.initial_threshold);
        // Start the floor where it would put the target on the initial threshold
        self.noise_floor = self.threshold / NOISE_MULTIPLIER;
        self.speech_start = None;
        self.silence_start = None;
    }
}

impl fmt::Debug for VoiceActivityDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceActivityDetector")
            .field("state", &self.state)
            .field("energy", &self.smoothed_energy)
            .field("threshold", &self.threshold)
            .field("noise_floor", &self.noise_floor)
            .finish()
    }
}
