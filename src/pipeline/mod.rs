//! Streaming pipelines
//!
//! A pipeline moves PCM between one device line and one UDP socket until
//! its stop signal fires or the stream ends. Device calls block, so they
//! run on tokio's blocking pool while the socket side stays async.
//!
//! Teardown order is fixed: drain (playback only), stop and close the
//! device, then close the socket.

pub mod capture;
pub mod mic_relay;
pub mod playback;

use std::net::Ipv4Addr;
use tokio::net::UdpSocket;

use crate::error::AudioError;
use crate::network::udp::leave_multicast;

/// Open a device line on the blocking pool
pub(crate) async fn open_line<T, F>(open: F) -> Result<T, AudioError>
where
    F: FnOnce() -> Result<T, AudioError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(open)
        .await
        .map_err(|e| AudioError::Worker(e.to_string()))?
}

/// Why a pipeline loop returned without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    /// The stop signal fired
    Stopped,
    /// The device line reported end of stream
    EndOfStream,
}

/// Datagram counters kept by a pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub datagrams: u64,
    pub bytes: u64,
}

impl PipelineStats {
    fn record(&mut self, len: usize) {
        self.datagrams += 1;
        self.bytes += len as u64;
    }
}

/// A socket plus the multicast group it joined, if any
pub struct Endpoint {
    socket: UdpSocket,
    group: Option<Ipv4Addr>,
}

impl Endpoint {
    pub fn unicast(socket: UdpSocket) -> Self {
        Self { socket, group: None }
    }

    pub fn multicast(socket: UdpSocket, group: Ipv4Addr) -> Self {
        Self {
            socket,
            group: Some(group),
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Leave the group if joined, then close the socket
    pub fn close(self) {
        if let Some(group) = self.group {
            leave_multicast(&self.socket, group);
        }
        drop(self.socket);
    }
}
