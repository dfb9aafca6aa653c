//! Configuration for the streaming engine
//!
//! The engine never persists settings. It reads a TOML file from the
//! platform config directory when one exists and otherwise runs on
//! defaults. Every value is validated before a session uses it.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::DeviceId;
use crate::constants::*;
use crate::error::ConfigError;

/// Sample rates offered for streaming
pub const SUPPORTED_SAMPLE_RATES: [u32; 3] = [44100, 48000, 96000];

/// Bit depths offered for streaming
pub const SUPPORTED_BIT_DEPTHS: [u16; 2] = [8, 16];

/// PCM format shared by both ends of a stream.
///
/// Samples are signed, little-endian and interleaved. `buffer_size` is in
/// bytes and is the size of one device read, hence of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
    pub buffer_size: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            bit_depth: DEFAULT_BIT_DEPTH,
            channels: DEFAULT_CHANNELS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, bit_depth: u16, channels: u16, buffer_size: usize) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
            buffer_size,
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_size(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Buffer size truncated to a whole number of frames.
    ///
    /// Fails when not even one frame fits.
    pub fn adjusted_buffer_size(&self) -> Result<usize, ConfigError> {
        let frame_size = self.frame_size();
        let adjusted = if frame_size == 0 {
            0
        } else {
            (self.buffer_size / frame_size) * frame_size
        };

        if adjusted == 0 {
            return Err(ConfigError::InvalidBuffer {
                buffer_size: self.buffer_size,
                frame_size,
            });
        }
        Ok(adjusted)
    }

    /// Receive buffer size for playback, with headroom for oversized datagrams
    pub fn receive_buffer_size(&self) -> usize {
        self.buffer_size * 2
    }

    /// Check the sample rate, bit depth and channel count against the
    /// supported sets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::UnsupportedFormat(format!(
                "sample rate {} Hz",
                self.sample_rate
            )));
        }
        if !SUPPORTED_BIT_DEPTHS.contains(&self.bit_depth) {
            return Err(ConfigError::UnsupportedFormat(format!(
                "bit depth {}",
                self.bit_depth
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ConfigError::UnsupportedFormat(format!(
                "{} channels",
                self.channels
            )));
        }
        Ok(())
    }
}

/// Network parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Main audio stream port
    pub streaming_port: u16,
    /// Microphone return channel port
    pub mic_port: u16,
    /// Discovery beacon port
    pub discovery_port: u16,
    /// Group used by beacons and multicast streams
    pub multicast_group: Ipv4Addr,
    /// Stream to the group instead of a single handshaken client
    pub multicast: bool,
    /// Whether a server announces itself
    pub announce: bool,
    pub announce_interval_ms: u64,
    pub discovery_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub hello_resend_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            streaming_port: DEFAULT_STREAMING_PORT,
            mic_port: DEFAULT_MIC_PORT,
            discovery_port: DISCOVERY_PORT,
            multicast_group: MULTICAST_GROUP,
            multicast: true,
            announce: true,
            announce_interval_ms: 3000,
            discovery_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            hello_resend_ms: 500,
        }
    }
}

impl NetworkConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn hello_resend(&self) -> Duration {
        Duration::from_millis(self.hello_resend_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for port in [self.streaming_port, self.mic_port, self.discovery_port] {
            validate_port(port)?;
        }
        for (name, ms) in [
            ("announce_interval_ms", self.announce_interval_ms),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("hello_resend_ms", self.hello_resend_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }
}

/// Devices picked by the user, by provider id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelection {
    pub capture: Option<DeviceId>,
    pub playback: Option<DeviceId>,
    pub mic_capture: Option<DeviceId>,
    pub mic_playback: Option<DeviceId>,
    pub send_mic: bool,
}

/// Full application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioFormat,
    pub network: NetworkConfig,
    pub devices: DeviceSelection,
}

impl AppConfig {
    /// Location of `config.toml` for this platform
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "mavco", "wifi-audio-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the platform config directory, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.audio.validate()?;
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.audio.buffer_size) {
            return Err(ConfigError::BufferOutOfRange(self.audio.buffer_size));
        }
        self.network.validate()
    }
}

/// Ports must lie in 1..=65535
pub fn validate_port(port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::InvalidPort(port));
    }
    Ok(())
}
