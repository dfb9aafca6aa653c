//! Status notifications for the embedding application
//!
//! The engine never formats user-facing text. It emits a semantic key plus
//! ordered arguments, and the caller localizes and renders them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Semantic event keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "&'static str")]
pub enum StatusKey {
    ErrorNoDevice,
    ErrorUnsupportedFormat,
    ErrorInvalidBuffer,
    ErrorInvalidPort,
    ErrorCriticalLine,
    ErrorServer,
    ErrorClient,
    ServerWaiting,
    ClientConnected,
    MulticastStreaming,
    ServerStopped,
    ContactingServer,
    WaitingAck,
    HandshakeFailed,
    ServerNoResponse,
    ConnectedStreamingFrom,
    JoiningMulticast,
    StreamingEnded,
    MicRelayUnavailable,
    MicRelayError,
    DiscoveryError,
}

impl StatusKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKey::ErrorNoDevice => "status_error_no_device",
            StatusKey::ErrorUnsupportedFormat => "status_error_unsupported_format",
            StatusKey::ErrorInvalidBuffer => "status_error_invalid_buffer",
            StatusKey::ErrorInvalidPort => "status_error_invalid_port",
            StatusKey::ErrorCriticalLine => "status_error_critical_line",
            StatusKey::ErrorServer => "status_error_server",
            StatusKey::ErrorClient => "status_error_client",
            StatusKey::ServerWaiting => "status_server_waiting",
            StatusKey::ClientConnected => "status_client_connected",
            StatusKey::MulticastStreaming => "status_multicast_streaming",
            StatusKey::ServerStopped => "status_server_stopped",
            StatusKey::ContactingServer => "status_contacting_server",
            StatusKey::WaitingAck => "status_waiting_ack",
            StatusKey::HandshakeFailed => "status_handshake_failed",
            StatusKey::ServerNoResponse => "status_server_no_response",
            StatusKey::ConnectedStreamingFrom => "status_connected_streaming_from",
            StatusKey::JoiningMulticast => "status_joining_multicast",
            StatusKey::StreamingEnded => "status_streaming_ended",
            StatusKey::MicRelayUnavailable => "status_mic_relay_unavailable",
            StatusKey::MicRelayError => "status_error_mic_relay",
            StatusKey::DiscoveryError => "status_error_discovery",
        }
    }

    /// Whether this key closes a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusKey::ServerStopped | StatusKey::StreamingEnded)
    }
}

impl From<StatusKey> for &'static str {
    fn from(key: StatusKey) -> Self {
        key.as_str()
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque event argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StatusArg {
    Port(u16),
    Addr(SocketAddr),
    Text(String),
}

impl From<u16> for StatusArg {
    fn from(port: u16) -> Self {
        StatusArg::Port(port)
    }
}

impl From<SocketAddr> for StatusArg {
    fn from(addr: SocketAddr) -> Self {
        StatusArg::Addr(addr)
    }
}

impl From<String> for StatusArg {
    fn from(text: String) -> Self {
        StatusArg::Text(text)
    }
}

impl fmt::Display for StatusArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusArg::Port(port) => write!(f, "{}", port),
            StatusArg::Addr(addr) => write!(f, "{}", addr),
            StatusArg::Text(text) => f.write_str(text),
        }
    }
}

/// One lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub key: StatusKey,
    pub args: Vec<StatusArg>,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(key: StatusKey) -> Self {
        Self {
            key,
            args: Vec::new(),
            at: Utc::now(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<StatusArg>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Receiver of status events. Called from pipeline tasks, so it must not block.
pub trait StatusSink: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

impl StatusSink for mpsc::UnboundedSender<StatusEvent> {
    fn notify(&self, event: StatusEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(event);
    }
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn notify(&self, event: StatusEvent) {
        let args: Vec<String> = event.args.iter().map(ToString::to_string).collect();
        tracing::info!(key = event.key.as_str(), args = ?args, "status");
    }
}

/// Sink that writes one JSON object per line to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesSink;

impl StatusSink for JsonLinesSink {
    fn notify(&self, event: StatusEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{}", line);
            }
            Err(e) => tracing::warn!("Failed to serialize status event: {}", e),
        }
    }
}
