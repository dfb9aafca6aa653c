//! Error types for the audio streaming engine

use std::net::SocketAddr;
use thiserror::Error;

use crate::session::SessionHandle;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Line is closed")]
    LineClosed,

    #[error("Device {0} stopped consuming audio")]
    Stalled(String),

    #[error("Device worker failed: {0}")]
    Worker(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Multicast join failed: {0}")]
    JoinFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("Receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    #[error("Interface enumeration failed: {0}")]
    Interfaces(String),
}

/// Handshake failures
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("No response from server within {0} ms")]
    Timeout(u64),

    #[error("Unexpected handshake payload from {from}: {payload:?}")]
    UnexpectedPayload { from: SocketAddr, payload: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No audio device selected")]
    NoDevice,

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Buffer size {buffer_size} bytes holds no complete frame of {frame_size} bytes")]
    InvalidBuffer { buffer_size: usize, frame_size: usize },

    #[error("Buffer size {0} out of range 512..=8192")]
    BufferOutOfRange(usize),

    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {0} is still active")]
    Busy(SessionHandle),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
