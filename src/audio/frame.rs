//! Audio frames and energy measurement

use std::time::Duration;

/// One capture period of mono samples normalized to `[-1.0, 1.0]`.
///
/// `timestamp` is the offset of the frame's first sample from the start of
/// the capture session; the detector uses it as its clock so that frame
/// processing stays deterministic and never reads wall time.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub timestamp: Duration,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, timestamp: Duration) -> Self {
        Self { samples, timestamp }
    }
}

/// Root-mean-square amplitude of `samples`.
///
/// Empty input and non-finite samples contribute zero energy.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .filter(|s| s.is_finite())
        .map(|&s| (s as f64) * (s as f64))
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}
