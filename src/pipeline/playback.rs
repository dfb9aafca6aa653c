//! Network → device
//!
//! Datagrams are written to the device unchanged and in arrival order.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::audio::PlaybackLine;
use crate::error::{AudioError, Error, NetworkError};
use crate::network::udp::is_transient;
use crate::pipeline::{Endpoint, PipelineEnd, PipelineStats};
use crate::session::StopSignal;

/// Playback line shared between the pipeline and its blocking writes
pub type SharedPlayback = Arc<Mutex<Box<dyn PlaybackLine>>>;

pub fn share(line: Box<dyn PlaybackLine>) -> SharedPlayback {
    Arc::new(Mutex::new(line))
}

/// Receive into a `recv_size` buffer and play every non-empty datagram
/// until stopped. Does not release the line.
pub async fn pump(
    line: &SharedPlayback,
    socket: &UdpSocket,
    recv_size: usize,
    stop: &StopSignal,
) -> Result<(PipelineEnd, PipelineStats), Error> {
    let mut stats = PipelineStats::default();
    let mut buf = vec![0u8; recv_size];

    loop {
        let received = tokio::select! {
            _ = stop.triggered() => return Ok((PipelineEnd::Stopped, stats)),
            r = socket.recv_from(&mut buf) => r,
        };

        let n = match received {
            Ok((0, _)) => continue,
            Ok((n, _)) => n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(NetworkError::ReceiveFailed(e).into()),
        };

        let data = Bytes::copy_from_slice(&buf[..n]);
        let writer = line.clone();
        tokio::task::spawn_blocking(move || writer.lock().write(&data))
            .await
            .map_err(|e| AudioError::Worker(e.to_string()))??;
        stats.record(n);
    }
}

/// Drain, stop and close the line
pub async fn release(line: SharedPlayback) {
    let result = tokio::task::spawn_blocking(move || {
        let mut line = line.lock();
        line.drain();
        line.stop();
        line.close();
    })
    .await;

    if let Err(e) = result {
        tracing::error!("Playback release failed: {}", e);
    }
}

/// Full playback pipeline: pump, then release the line, then close the socket
pub async fn run(
    line: Box<dyn PlaybackLine>,
    endpoint: Endpoint,
    recv_size: usize,
    stop: &StopSignal,
) -> Result<PipelineEnd, Error> {
    let line = share(line);
    let result = pump(&line, endpoint.socket(), recv_size, stop).await;

    release(line).await;
    endpoint.close();

    let (end, stats) = result?;
    tracing::info!(
        "Playback ended ({:?}): {} datagrams, {:.1} KB",
        end,
        stats.datagrams,
        stats.bytes as f64 / 1024.0
    );
    Ok(end)
}
