//! Configuration loading and management
//!
//! Everything comes from the environment with defaults; a value that is
//! set but does not parse is an error rather than silently ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::session::SessionConfig;
use crate::vad::VadConfig;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Expected duration of each audio frame pushed by the host
    pub frame_ms: u64,

    pub vad: VadConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home = lookup("HOME").ok_or_else(|| anyhow!("HOME is not set"))?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("voice-turn");

        let socket_path = lookup("VOICE_TURN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let frame_ms = parse_or(&lookup, "VOICE_TURN_FRAME_MS", 30u64)?;
        if frame_ms == 0 {
            return Err(anyhow!("VOICE_TURN_FRAME_MS must be positive"));
        }

        let vad = VadConfig {
            sample_rate: parse_or(&lookup, "VOICE_TURN_SAMPLE_RATE", 16000u32)?,
            min_speech_duration_ms: parse_or(&lookup, "VOICE_TURN_MIN_SPEECH_MS", 300u64)?,
            silence_timeout_ms: parse_or(&lookup, "VOICE_TURN_SILENCE_TIMEOUT_MS", 800u64)?,
            ..Default::default()
        };
        vad.validate().context("invalid VAD configuration")?;

        let session = SessionConfig {
            settle_delay: millis_or(&lookup, "VOICE_TURN_SETTLE_MS", 300)?,
            error_cooldown: millis_or(&lookup, "VOICE_TURN_ERROR_COOLDOWN_MS", 3000)?,
            stt_restart_delay: millis_or(&lookup, "VOICE_TURN_STT_RESTART_MS", 100)?,
            completion_timeout: millis_or(&lookup, "VOICE_TURN_COMPLETION_TIMEOUT_MS", 15000)?,
            voice: lookup("VOICE_TURN_VOICE").unwrap_or_else(|| "alloy".to_string()),
        };

        Ok(Self {
            socket_path,
            data_dir,
            frame_ms,
            vad,
            session,
        })
    }

    /// Samples the host should put in each frame
    pub fn samples_per_frame(&self) -> usize {
        (self.vad.sample_rate as u64 * self.frame_ms / 1000) as usize
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    parse_or(lookup, key, default).map(Duration::from_millis)
}
