//! Wire format of the control messages
//!
//! Control messages are UTF-8 text. Audio datagrams carry raw PCM with no
//! header, so nothing here touches them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Prefix of every discovery beacon
pub const DISCOVERY_TAG: &str = "WIFI_AUDIO_STREAMER_DISCOVERY";

/// Payload a unicast client opens the handshake with
pub const CLIENT_HELLO: &str = "HELLO_FROM_CLIENT";

/// Payload the server answers a valid hello with
pub const HELLO_ACK: &str = "HELLO_ACK";

/// How a server delivers its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// One handshaken client
    Unicast,
    /// Any number of clients joined to the group
    Multicast,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Unicast => "UNICAST",
            TransportMode::Multicast => "MULTICAST",
        }
    }

    /// Case-insensitive; anything but `MULTICAST` means unicast
    pub fn parse(field: &str) -> Self {
        if field.eq_ignore_ascii_case("MULTICAST") {
            TransportMode::Multicast
        } else {
            TransportMode::Unicast
        }
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, TransportMode::Multicast)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server found through discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub addr: IpAddr,
    pub mode: TransportMode,
    pub port: u16,
}

impl PeerDescriptor {
    pub fn new(addr: IpAddr, mode: TransportMode, port: u16) -> Self {
        Self { addr, mode, port }
    }
}

/// Contents of a discovery beacon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub hostname: String,
    pub mode: TransportMode,
    pub port: u16,
}

impl Announcement {
    pub fn new(hostname: impl Into<String>, mode: TransportMode, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            mode,
            port,
        }
    }

    /// `TAG;hostname;MODE;port`
    pub fn encode(&self) -> String {
        format!("{};{};{};{}", DISCOVERY_TAG, self.hostname, self.mode, self.port)
    }

    /// Parse a beacon. Anything malformed yields `None`.
    pub fn parse(message: &str) -> Option<Self> {
        let message = message.trim();
        if !message.starts_with(DISCOVERY_TAG) {
            return None;
        }

        let parts: Vec<&str> = message.split(';').collect();
        if parts.len() != 4 || parts[0] != DISCOVERY_TAG {
            return None;
        }

        let port: u16 = parts[3].parse().ok()?;
        if port == 0 {
            return None;
        }

        Some(Self {
            hostname: parts[1].to_string(),
            mode: TransportMode::parse(parts[2]),
            port,
        })
    }
}

/// Compare a received control payload against an expected literal
pub fn payload_is(payload: &[u8], expected: &str) -> bool {
    std::str::from_utf8(payload)
        .map(|text| text.trim() == expected)
        .unwrap_or(false)
}
