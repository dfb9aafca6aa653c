//! # WiFi Audio Streamer
//!
//! Low-latency raw PCM streaming between two machines on a LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── SERVER ───────────────────────────┐
//! │  ┌─────────────┐        ┌───────────────────────────────────┐ │
//! │  │   Beacon    │──────▶ │ 239.255.0.1:9091                  │ │
//! │  │ (every 3 s) │        │ WIFI_AUDIO_STREAMER_DISCOVERY;... │ │
//! │  └─────────────┘        └───────────────────────────────────┘ │
//! │  ┌─────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │ Capture Dev │──▶│ Capture Loop │──▶│ UDP :9090          │  │
//! │  └─────────────┘   └──────────────┘   │ (unicast: after    │  │
//! │                                       │  HELLO / HELLO_ACK)│  │
//! │  ┌─────────────┐   ┌──────────────┐   └────────────────────┘  │
//! │  │ Mic Output  │◀──│ Playback Loop│◀── UDP :9092 (mic relay)  │
//! │  └─────────────┘   └──────────────┘                           │
//! └───────────────────────────────────────────────────────────────┘
//!                              ▲ │  UDP over LAN
//!                              │ ▼
//! ┌──────────────────────────── CLIENT ───────────────────────────┐
//! │  ┌─────────────┐                                              │
//! │  │  Listener   │──▶ on_peer(hostname, PeerDescriptor)         │
//! │  └─────────────┘                                              │
//! │  ┌─────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │ Playback Dev│◀──│ Playback Loop│◀──│ UDP (handshaken or │  │
//! │  └─────────────┘   └──────────────┘   │  group :9090)      │  │
//! │  ┌─────────────┐   ┌──────────────┐   └────────────────────┘  │
//! │  │ Microphone  │──▶│ Capture Loop │──▶ UDP :9092 (mic relay)  │
//! │  └─────────────┘   └──────────────┘                           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every pipeline is a tokio task owned by a [`session::SessionManager`]
//! session; stopping the session joins them all after their devices and
//! sockets have been released.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod status;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::net::Ipv4Addr;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default bit depth
    pub const DEFAULT_BIT_DEPTH: u16 = 16;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default bytes per device read
    pub const DEFAULT_BUFFER_SIZE: usize = 4096;

    /// Accepted buffer sizes in bytes
    pub const MIN_BUFFER_SIZE: usize = 512;
    pub const MAX_BUFFER_SIZE: usize = 8192;

    /// Default UDP port for the main audio stream
    pub const DEFAULT_STREAMING_PORT: u16 = 9090;

    /// Default UDP port for the microphone return channel
    pub const DEFAULT_MIC_PORT: u16 = 9092;

    /// Well-known port for discovery beacons
    pub const DISCOVERY_PORT: u16 = 9091;

    /// Group shared by beacons and multicast streams
    pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

    /// Largest discovery datagram we read
    pub const MAX_DISCOVERY_PACKET: usize = 1024;
}
