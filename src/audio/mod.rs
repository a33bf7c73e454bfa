//! Audio primitives shared by capture, detection and playback
//!
//! - `AudioFrame`: one fixed-length buffer of normalized samples
//! - `AudioDevice` / `DeviceLease`: scoped ownership of the process-wide
//!   capture and output devices

mod device;
mod frame;

pub use device::{AudioDevice, DeviceLease};
pub use frame::{rms, AudioFrame};
