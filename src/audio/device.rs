//! Audio device enumeration and the cpal-backed provider

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, StreamConfig, SupportedBufferSize, SupportedStreamConfigRange};

use crate::audio::{
    AudioDeviceInfo, AudioDeviceProvider, CaptureLine, CpalCaptureLine, CpalPlaybackLine,
    PlaybackLine,
};
use crate::config::{AudioFormat, SUPPORTED_SAMPLE_RATES};
use crate::error::AudioError;

/// Name fragment of the virtual cable usually picked as mic output
const VIRTUAL_CABLE_HINT: &str = "CABLE Input";

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub is_input: bool,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, is_input: bool) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            is_input,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    fn supported_configs(&self) -> Result<Vec<SupportedStreamConfigRange>, AudioError> {
        let configs = if self.is_input {
            self.inner.supported_input_configs().map(|iter| iter.collect())
        } else {
            self.inner.supported_output_configs().map(|iter| iter.collect())
        };
        configs.map_err(|e| AudioError::DeviceNotFound(e.to_string()))
    }

    /// Build a stream config for `format`, or fail if the device cannot do it
    pub fn stream_config(
        &self,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let native = sample_format_for(format)?;
        let rate = cpal::SampleRate(format.sample_rate);
        let configs = self.supported_configs()?;
        let supports = |c: &SupportedStreamConfigRange, sample_format: SampleFormat| {
            c.channels() == format.channels
                && c.sample_format() == sample_format
                && rate >= c.min_sample_rate()
                && rate <= c.max_sample_rate()
        };

        // Integer formats first; f32-only devices get converted samples
        let (range, sample_format) = [native, SampleFormat::F32]
            .into_iter()
            .find_map(|sample_format| {
                configs
                    .iter()
                    .find(|c| supports(c, sample_format))
                    .map(|c| (c, sample_format))
            })
            .ok_or_else(|| {
                AudioError::UnsupportedFormat(format!(
                    "{} does not support {} Hz, {} bit, {} ch",
                    self.name, format.sample_rate, format.bit_depth, format.channels
                ))
            })?;

        let frames = (buffer_bytes / format.frame_size().max(1)) as u32;
        let buffer_size = match range.buffer_size() {
            SupportedBufferSize::Range { min, max } if frames >= *min && frames <= *max => {
                cpal::BufferSize::Fixed(frames)
            }
            _ => cpal::BufferSize::Default,
        };

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: rate,
            buffer_size,
        };
        Ok((config, sample_format))
    }
}

/// cpal sample type for a bit depth
pub fn sample_format_for(format: &AudioFormat) -> Result<SampleFormat, AudioError> {
    match format.bit_depth {
        8 => Ok(SampleFormat::I8),
        16 => Ok(SampleFormat::I16),
        other => Err(AudioError::UnsupportedFormat(format!("bit depth {}", other))),
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    is_default: default_output_name.as_ref() == Some(&name),
                    name,
                    is_input: false,
                    is_output: true,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

/// Get device capabilities, restricted to the rates we stream at
fn get_device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in configs {
        for rate_val in SUPPORTED_SAMPLE_RATES {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate()
                && rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate_val)
            {
                sample_rates.push(rate_val);
            }
        }

        let ch = config.channels();
        if !channels.contains(&ch) {
            channels.push(ch);
        }
    }

    sample_rates.sort();
    channels.sort();
    (sample_rates, channels)
}

/// Get a device by its ID
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
        (true, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (false, name)
    } else {
        // Bare names are looked up among inputs
        (true, id)
    };

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    };
    let devices = devices.map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name == name {
                return Ok(AudioDevice::from_cpal(device, is_input));
            }
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Output for the server-side mic relay: a virtual cable when one exists
pub fn preferred_mic_output(devices: &[AudioDeviceInfo]) -> Option<&AudioDeviceInfo> {
    let outputs = || devices.iter().filter(|d| d.is_output);
    outputs()
        .find(|d| {
            d.name
                .to_lowercase()
                .contains(&VIRTUAL_CABLE_HINT.to_lowercase())
        })
        .or_else(|| outputs().next())
}

/// Device provider backed by the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalProvider;

impl AudioDeviceProvider for CpalProvider {
    fn capture_devices(&self) -> Vec<AudioDeviceInfo> {
        list_devices().into_iter().filter(|d| d.is_input).collect()
    }

    fn playback_devices(&self) -> Vec<AudioDeviceInfo> {
        list_devices().into_iter().filter(|d| d.is_output).collect()
    }

    fn open_capture(
        &self,
        device: &str,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn CaptureLine>, AudioError> {
        let line = CpalCaptureLine::open(device, format, buffer_bytes)?;
        Ok(Box::new(line))
    }

    fn open_playback(
        &self,
        device: &str,
        format: &AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn PlaybackLine>, AudioError> {
        let line = CpalPlaybackLine::open(device, format, buffer_bytes)?;
        Ok(Box::new(line))
    }
}
