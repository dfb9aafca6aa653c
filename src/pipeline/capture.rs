//! Device → network
//!
//! One device read becomes exactly one datagram.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::audio::CaptureLine;
use crate::error::{AudioError, Error, NetworkError};
use crate::network::udp::is_transient;
use crate::pipeline::{Endpoint, PipelineEnd, PipelineStats};
use crate::session::StopSignal;

/// Capture line shared between the pipeline and its blocking reads
pub type SharedCapture = Arc<Mutex<Box<dyn CaptureLine>>>;

pub fn share(line: Box<dyn CaptureLine>) -> SharedCapture {
    Arc::new(Mutex::new(line))
}

/// Read from `line` and send each non-empty read to `dest` until stopped
/// or the line ends. Does not release the line.
pub async fn pump(
    line: &SharedCapture,
    socket: &UdpSocket,
    dest: SocketAddr,
    read_size: usize,
    stop: &StopSignal,
) -> Result<(PipelineEnd, PipelineStats), Error> {
    let mut stats = PipelineStats::default();
    let mut buf = vec![0u8; read_size];

    loop {
        if stop.is_triggered() {
            return Ok((PipelineEnd::Stopped, stats));
        }

        let reader = line.clone();
        let (returned, read) = tokio::task::spawn_blocking(move || {
            let read = reader.lock().read(&mut buf);
            (buf, read)
        })
        .await
        .map_err(|e| AudioError::Worker(e.to_string()))?;
        buf = returned;

        let n = match read? {
            None => return Ok((PipelineEnd::EndOfStream, stats)),
            Some(0) => continue,
            Some(n) => n,
        };

        if stop.is_triggered() {
            return Ok((PipelineEnd::Stopped, stats));
        }

        match socket.send_to(&buf[..n], dest).await {
            Ok(_) => stats.record(n),
            // Receiver not there right now; the frame is simply lost
            Err(e) if is_transient(&e) => tracing::debug!("Dropped frame to {}: {}", dest, e),
            Err(e) => return Err(NetworkError::SendFailed(e).into()),
        }
    }
}

/// Stop and close the line
pub async fn release(line: SharedCapture) {
    let result = tokio::task::spawn_blocking(move || {
        let mut line = line.lock();
        line.stop();
        line.close();
    })
    .await;

    if let Err(e) = result {
        tracing::error!("Capture release failed: {}", e);
    }
}

/// Full capture pipeline: pump, then release the line, then close the socket
pub async fn run(
    line: Box<dyn CaptureLine>,
    endpoint: Endpoint,
    dest: SocketAddr,
    read_size: usize,
    stop: &StopSignal,
) -> Result<PipelineEnd, Error> {
    let line = share(line);
    let result = pump(&line, endpoint.socket(), dest, read_size, stop).await;

    release(line).await;
    endpoint.close();

    let (end, stats) = result?;
    tracing::info!(
        "Capture to {} ended ({:?}): {} datagrams, {:.1} KB",
        dest,
        end,
        stats.datagrams,
        stats.bytes as f64 / 1024.0
    );
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::ChunkQueue;
    use crate::audio::memory::MemoryProvider;
    use crate::audio::AudioDeviceProvider;
    use crate::config::AudioFormat;
    use crate::network::udp::bind_ephemeral;
    use bytes::Bytes;
    use crossbeam_channel::{bounded, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Device that opened fine and then never delivers a callback
    struct SilentDeviceLine {
        queue: ChunkQueue,
        running: AtomicBool,
        _data_tx: Sender<Bytes>,
        _error_tx: Sender<AudioError>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CaptureLine for SilentDeviceLine {
        fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, AudioError> {
            self.queue.read(buf, &self.running)
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            self.log.lock().push("stop");
        }

        fn close(&mut self) {
            self.log.lock().push("close");
        }
    }

    #[tokio::test]
    async fn test_one_read_one_datagram() {
        let provider = MemoryProvider::new();
        provider.script_capture(
            "mic",
            vec![vec![1u8; 512], Vec::new(), vec![2u8; 256], vec![3u8; 512]],
            true,
        );
        let line = provider.open_capture("mic", &AudioFormat::default(), 512).unwrap();

        let receiver = bind_ephemeral().unwrap();
        let dest = SocketAddr::from(([127, 0, 0, 1], receiver.local_addr().unwrap().port()));
        let stop = StopSignal::new();

        let end = run(line, Endpoint::unicast(bind_ephemeral().unwrap()), dest, 512, &stop)
            .await
            .unwrap();
        assert_eq!(end, PipelineEnd::EndOfStream);

        let mut buf = [0u8; 2048];
        let mut sizes = Vec::new();
        for _ in 0..3 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            sizes.push((n, buf[0]));
        }
        // Empty read produced nothing
        assert_eq!(sizes, vec![(512, 1), (256, 2), (512, 3)]);
        assert_eq!(provider.lifecycle("mic"), vec!["open", "stop", "close"]);
    }

    #[tokio::test]
    async fn test_stop_releases_line() {
        let provider = MemoryProvider::new();
        provider.script_capture("mic", Vec::new(), false);
        let line = provider.open_capture("mic", &AudioFormat::default(), 512).unwrap();

        let stop = StopSignal::new();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move {
                let dest = SocketAddr::from(([127, 0, 0, 1], 9));
                run(line, Endpoint::unicast(bind_ephemeral().unwrap()), dest, 512, &stop).await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.trigger();
        let end = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(end.unwrap(), PipelineEnd::Stopped);
        assert_eq!(provider.lifecycle("mic"), vec!["open", "stop", "close"]);
    }

    #[tokio::test]
    async fn test_stop_while_device_is_silent() {
        let (data_tx, data_rx) = bounded(1);
        let (error_tx, error_rx) = bounded(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let line = Box::new(SilentDeviceLine {
            queue: ChunkQueue::new(data_rx, error_rx),
            running: AtomicBool::new(true),
            _data_tx: data_tx,
            _error_tx: error_tx,
            log: log.clone(),
        });

        let stop = StopSignal::new();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move {
                let dest = SocketAddr::from(([127, 0, 0, 1], 9));
                run(line, Endpoint::unicast(bind_ephemeral().unwrap()), dest, 4096, &stop).await
            })
        };

        // Several read polls go by with no audio at all
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.trigger();
        let end = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(end.unwrap(), PipelineEnd::Stopped);
        assert_eq!(*log.lock(), vec!["stop", "close"]);
    }
}
