//! Scoped ownership of the process-wide audio devices
//!
//! The microphone and the output device are singletons per process. Instead
//! of ambient global flags, each is modelled as an `AudioDevice` handle that
//! is injected into a session; holding a `DeviceLease` is the only way to
//! use the device, and dropping it releases the device.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{TurnError, TurnResult};

/// A shareable handle to one exclusive audio device
#[derive(Clone)]
pub struct AudioDevice {
    name: &'static str,
    in_use: Arc<AtomicBool>,
}

impl AudioDevice {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The device name used in logs and errors
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether some lease currently holds the device
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Take exclusive use of the device until the returned lease is dropped
    pub fn acquire(&self) -> TurnResult<DeviceLease> {
        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(TurnError::DeviceBusy(self.name));
        }
        debug!(device = self.name, "audio device acquired");
        Ok(DeviceLease {
            name: self.name,
            in_use: Arc::clone(&self.in_use),
        })
    }
}

impl fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDevice")
            .field("name", &self.name)
            .field("in_use", &self.is_in_use())
            .finish()
    }
}

/// Exclusive use of an `AudioDevice`; releases it on drop
#[derive(Debug)]
pub struct DeviceLease {
    name: &'static str,
    in_use: Arc<AtomicBool>,
}

impl DeviceLease {
    pub fn device_name(&self) -> &'static str {
        self.name
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::SeqCst);
        debug!(device = self.name, "audio device released");
    }
}
