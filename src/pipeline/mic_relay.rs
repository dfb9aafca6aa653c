//! Microphone return channel
//!
//! The client captures its microphone and sends it to the server's mic
//! port; the server plays whatever arrives there. Both halves are optional
//! and a failure in either never takes the main stream down.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::audio::{AudioDeviceProvider, DeviceId};
use crate::config::AudioFormat;
use crate::error::Error;
use crate::network::udp::{bind_ephemeral, bind_multicast, bind_reusable, multicast_sender};
use crate::pipeline::{capture, open_line, playback, Endpoint};
use crate::protocol::TransportMode;
use crate::session::StopSignal;
use crate::status::{StatusEvent, StatusKey, StatusSink};

/// Spawn the client half. Returns `None` when no mic device is selected.
pub fn spawn_mic_sender(
    provider: Arc<dyn AudioDeviceProvider>,
    status: Arc<dyn StatusSink>,
    format: AudioFormat,
    device: Option<DeviceId>,
    dest: SocketAddr,
    stop: StopSignal,
) -> Option<JoinHandle<()>> {
    let device = device?;

    Some(tokio::spawn(async move {
        let read_size = match format.adjusted_buffer_size() {
            Ok(size) => size,
            Err(e) => {
                status.notify(unavailable(&device, &e.into()));
                return;
            }
        };

        let line = {
            let provider = provider.clone();
            let device = device.clone();
            open_line(move || provider.open_capture(&device, &format, read_size)).await
        };
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                status.notify(unavailable(&device, &e.into()));
                return;
            }
        };

        let socket = if dest.ip().is_multicast() {
            multicast_sender()
        } else {
            bind_ephemeral()
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                capture::release(capture::share(line)).await;
                status.notify(relay_error(&e.into()));
                return;
            }
        };

        tracing::info!("Sending microphone {} to {}", device, dest);
        if let Err(e) = capture::run(line, Endpoint::unicast(socket), dest, read_size, &stop).await {
            tracing::error!("Mic sender failed: {}", e);
            status.notify(relay_error(&e));
        }
    }))
}

/// Spawn the server half. Returns `None` when no output device is selected.
#[allow(clippy::too_many_arguments)]
pub fn spawn_mic_receiver(
    provider: Arc<dyn AudioDeviceProvider>,
    status: Arc<dyn StatusSink>,
    format: AudioFormat,
    device: Option<DeviceId>,
    mode: TransportMode,
    group: Ipv4Addr,
    port: u16,
    stop: StopSignal,
) -> Option<JoinHandle<()>> {
    let device = device?;

    Some(tokio::spawn(async move {
        let endpoint = if mode.is_multicast() {
            bind_multicast(group, port).map(|socket| Endpoint::multicast(socket, group))
        } else {
            bind_reusable(port).map(Endpoint::unicast)
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                status.notify(relay_error(&e.into()));
                return;
            }
        };

        let buffer_bytes = match format.adjusted_buffer_size() {
            Ok(size) => size,
            Err(e) => {
                endpoint.close();
                status.notify(unavailable(&device, &e.into()));
                return;
            }
        };
        let line = {
            let provider = provider.clone();
            let device = device.clone();
            open_line(move || provider.open_playback(&device, &format, buffer_bytes)).await
        };
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                endpoint.close();
                status.notify(unavailable(&device, &e.into()));
                return;
            }
        };

        tracing::info!("Playing microphone relay from port {} on {}", port, device);
        if let Err(e) = playback::run(line, endpoint, format.receive_buffer_size(), &stop).await {
            tracing::error!("Mic receiver failed: {}", e);
            status.notify(relay_error(&e));
        }
    }))
}

fn unavailable(device: &str, error: &Error) -> StatusEvent {
    tracing::warn!("Microphone relay unavailable on {}: {}", device, error);
    StatusEvent::new(StatusKey::MicRelayUnavailable)
        .with_arg(device.to_string())
        .with_arg(error.to_string())
}

fn relay_error(error: &Error) -> StatusEvent {
    StatusEvent::new(StatusKey::MicRelayError).with_arg(error.to_string())
}
