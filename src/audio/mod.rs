//! Audio subsystem module
//!
//! The engine talks to sound hardware only through [`AudioDeviceProvider`]
//! and the blocking line traits below. [`CpalProvider`] is the real backend.

pub mod capture;
pub mod device;
pub mod pcm;
pub mod playback;

#[cfg(test)]
pub(crate) mod memory;

use serde::Serialize;

use crate::config::AudioFormat;
use crate::error::AudioError;

pub use capture::CpalCaptureLine;
pub use device::{get_device_by_id, list_devices, preferred_mic_output, CpalProvider};
pub use playback::CpalPlaybackLine;

/// Provider-specific device identifier, e.g. `input:Stereo Mix`
pub type DeviceId = String;

/// Description of an enumerated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Source of PCM bytes. Reads block until data is available.
pub trait CaptureLine: Send {
    /// Read up to `buf.len()` bytes.
    ///
    /// `Ok(Some(0))` is a spurious wake, `Ok(None)` means the line has ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, AudioError>;

    fn stop(&mut self);

    fn close(&mut self);
}

/// Sink of PCM bytes. Writes block while the device queue is full.
pub trait PlaybackLine: Send {
    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError>;

    /// Block until queued audio has been played
    fn drain(&mut self);

    fn stop(&mut self);

    fn close(&mut self);
}

/// Enumerates and opens audio devices
pub trait AudioDeviceProvider: Send + Sync {
    fn capture_devices(&self) -> Vec<AudioDeviceInfo>;

    fn playback_devices(&self) -> Vec<AudioDeviceInfo>;

    /// Open and start a capture line producing `format` in reads of `buffer_bytes`
    fn open_capture(
        &self,
        device: &str,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn CaptureLine>, AudioError>;

    /// Open and start a playback line with `buffer_bytes` of device queue
    fn open_playback(
        &self,
        device: &str,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn PlaybackLine>, AudioError>;
}
