//! In-memory device provider for tests
//!
//! Capture lines replay scripted chunks; playback lines record every write.
//! Each line logs its lifecycle calls so tests can check teardown order.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::{AudioDeviceInfo, AudioDeviceProvider, CaptureLine, PlaybackLine};
use crate::config::AudioFormat;
use crate::error::AudioError;

#[derive(Default)]
struct State {
    scripts: HashMap<String, VecDeque<Vec<u8>>>,
    eof_after_script: HashSet<String>,
    written: HashMap<String, Vec<Vec<u8>>>,
    lifecycle: HashMap<String, Vec<&'static str>>,
    opened: HashMap<String, usize>,
    rejected: HashSet<String>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryProvider {
    state: Arc<Mutex<State>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks the capture line on `device` returns, in order. With `eof`
    /// the line ends after the last chunk, otherwise it idles.
    pub fn script_capture(&self, device: &str, chunks: Vec<Vec<u8>>, eof: bool) {
        let mut state = self.state.lock();
        state.scripts.insert(device.to_string(), chunks.into());
        if eof {
            state.eof_after_script.insert(device.to_string());
        }
    }

    /// Make opening `device` fail
    pub fn reject(&self, device: &str) {
        self.state.lock().rejected.insert(device.to_string());
    }

    pub fn written(&self, device: &str) -> Vec<Vec<u8>> {
        self.state.lock().written.get(device).cloned().unwrap_or_default()
    }

    pub fn lifecycle(&self, device: &str) -> Vec<&'static str> {
        self.state.lock().lifecycle.get(device).cloned().unwrap_or_default()
    }

    /// Buffer size the device was opened with
    pub fn opened_with(&self, device: &str) -> Option<usize> {
        self.state.lock().opened.get(device).copied()
    }

    fn open(&self, device: &str, buffer_bytes: usize) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if state.rejected.contains(device) {
            return Err(AudioError::UnsupportedFormat(device.to_string()));
        }
        state.opened.insert(device.to_string(), buffer_bytes);
        state.lifecycle.entry(device.to_string()).or_default().push("open");
        Ok(())
    }

    fn log(&self, device: &str, call: &'static str) {
        self.state
            .lock()
            .lifecycle
            .entry(device.to_string())
            .or_default()
            .push(call);
    }
}

fn info(id: &str, is_input: bool) -> AudioDeviceInfo {
    AudioDeviceInfo {
        id: id.to_string(),
        name: id.to_string(),
        is_input,
        is_output: !is_input,
        is_default: false,
        sample_rates: vec![44100, 48000, 96000],
        channels: vec![1, 2],
    }
}

impl AudioDeviceProvider for MemoryProvider {
    fn capture_devices(&self) -> Vec<AudioDeviceInfo> {
        let state = self.state.lock();
        state.scripts.keys().map(|id| info(id, true)).collect()
    }

    fn playback_devices(&self) -> Vec<AudioDeviceInfo> {
        let state = self.state.lock();
        state.written.keys().map(|id| info(id, false)).collect()
    }

    fn open_capture(
        &self,
        device: &str,
        _format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn CaptureLine>, AudioError> {
        self.open(device, buffer_bytes)?;
        Ok(Box::new(MemoryCaptureLine {
            device: device.to_string(),
            provider: self.clone(),
            closed: false,
        }))
    }

    fn open_playback(
        &self,
        device: &str,
        _format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn PlaybackLine>, AudioError> {
        self.open(device, buffer_bytes)?;
        self.state.lock().written.entry(device.to_string()).or_default();
        Ok(Box::new(MemoryPlaybackLine {
            device: device.to_string(),
            provider: self.clone(),
        }))
    }
}

struct MemoryCaptureLine {
    device: String,
    provider: MemoryProvider,
    closed: bool,
}

impl CaptureLine for MemoryCaptureLine {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, AudioError> {
        if self.closed {
            return Ok(None);
        }
        let (chunk, eof) = {
            let mut state = self.provider.state.lock();
            let chunk = state.scripts.get_mut(&self.device).and_then(|s| s.pop_front());
            (chunk, state.eof_after_script.contains(&self.device))
        };

        match chunk {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(Some(n))
            }
            None if eof => Ok(None),
            None => {
                thread::sleep(Duration::from_millis(5));
                Ok(Some(0))
            }
        }
    }

    fn stop(&mut self) {
        self.provider.log(&self.device, "stop");
    }

    fn close(&mut self) {
        self.closed = true;
        self.provider.log(&self.device, "close");
    }
}

struct MemoryPlaybackLine {
    device: String,
    provider: MemoryProvider,
}

impl PlaybackLine for MemoryPlaybackLine {
    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        self.provider
            .state
            .lock()
            .written
            .entry(self.device.clone())
            .or_default()
            .push(data.to_vec());
        Ok(data.len())
    }

    fn drain(&mut self) {
        self.provider.log(&self.device, "drain");
    }

    fn stop(&mut self) {
        self.provider.log(&self.device, "stop");
    }

    fn close(&mut self) {
        self.provider.log(&self.device, "close");
    }
}
