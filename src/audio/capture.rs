//! Audio capture from input devices
//!
//! cpal delivers samples through a callback on its own thread. The line
//! keeps the stream alive on a dedicated thread and hands the converted
//! PCM bytes to the blocking [`CaptureLine::read`] side over a channel.

use bytes::{Bytes, BytesMut};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::get_device_by_id;
use crate::audio::pcm::{f32_to_i16_bytes, f32_to_i8_bytes, i16_to_bytes, i8_to_bytes};
use crate::audio::CaptureLine;
use crate::config::AudioFormat;
use crate::error::AudioError;

/// Callback chunks buffered between the device and the reader
const CAPTURE_QUEUE_CHUNKS: usize = 64;

/// How long a read waits before re-checking the line state
const READ_POLL: Duration = Duration::from_millis(50);

/// How long `open` waits for the stream thread to report
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capture line on a cpal input device
pub struct CpalCaptureLine {
    device_id: String,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Converted PCM chunks and stream errors from the callbacks
    queue: ChunkQueue,

    /// Chunks dropped because the reader fell behind
    chunks_dropped: Arc<AtomicU64>,
}

impl CpalCaptureLine {
    /// Open the device and start capturing
    pub fn open(device_id: &str, format: &AudioFormat, buffer_bytes: usize) -> Result<Self, AudioError> {
        let device = get_device_by_id(device_id)?;
        let (config, sample_format) = device.stream_config(format, buffer_bytes)?;

        let (data_tx, data_rx) = bounded::<Bytes>(CAPTURE_QUEUE_CHUNKS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let bit_depth = format.bit_depth;
        let chunks_dropped = Arc::new(AtomicU64::new(0));
        let stream_ctx = StreamContext {
            running: running.clone(),
            data_tx,
            error_tx,
            chunks_dropped: chunks_dropped.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("capture-{}", device_id))
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = match (sample_format, bit_depth) {
                    (SampleFormat::I8, _) => build_stream::<i8, _>(&cpal_device, &config, stream_ctx, i8_to_bytes),
                    (SampleFormat::F32, 8) => build_stream::<f32, _>(&cpal_device, &config, stream_ctx, f32_to_i8_bytes),
                    (SampleFormat::F32, _) => build_stream::<f32, _>(&cpal_device, &config, stream_ctx, f32_to_i16_bytes),
                    _ => build_stream::<i16, _>(&cpal_device, &config, stream_ctx, i16_to_bytes),
                };

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));

                        // Keep thread alive while running
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }

                        // Stream is dropped here, stopping capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    }
                }
            })
            .map_err(|e| AudioError::Worker(e.to_string()))?;

        let ready = ready_rx
            .recv_timeout(OPEN_TIMEOUT)
            .unwrap_or_else(|_| Err(AudioError::Worker("capture thread did not start".into())));

        let mut line = Self {
            device_id: device_id.to_string(),
            running,
            thread_handle: Some(handle),
            queue: ChunkQueue::new(data_rx, error_rx),
            chunks_dropped,
        };

        if let Err(e) = ready {
            line.stop();
            return Err(e);
        }

        tracing::info!(
            "Capture opened on {}: {} Hz, {} bit, {} ch",
            device_id,
            format.sample_rate,
            format.bit_depth,
            format.channels
        );
        Ok(line)
    }

    /// Chunks lost because reads fell behind the device
    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
}

impl CaptureLine for CpalCaptureLine {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, AudioError> {
        self.queue.read(buf, &self.running)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Capture stopped on {}", self.device_id);
        }
    }

    fn close(&mut self) {
        self.stop();
        self.queue.clear();
        let dropped = self.chunks_dropped();
        if dropped > 0 {
            tracing::debug!("Capture on {} dropped {} chunks", self.device_id, dropped);
        }
    }
}

impl Drop for CpalCaptureLine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reassembles callback chunks into reads of the caller's size
pub(crate) struct ChunkQueue {
    data_rx: Receiver<Bytes>,
    error_rx: Receiver<AudioError>,

    /// Leftover of a chunk larger than the last read
    pending: BytesMut,
}

impl ChunkQueue {
    pub(crate) fn new(data_rx: Receiver<Bytes>, error_rx: Receiver<AudioError>) -> Self {
        Self {
            data_rx,
            error_rx,
            pending: BytesMut::new(),
        }
    }

    /// Fill `buf` with queued audio.
    ///
    /// Returns early with whatever has arrived, possibly nothing, once the
    /// device has been quiet for [`READ_POLL`], so a silent device never
    /// keeps the caller from noticing a stop.
    pub(crate) fn read(&mut self, buf: &mut [u8], running: &AtomicBool) -> Result<Option<usize>, AudioError> {
        if buf.is_empty() {
            return Ok(Some(0));
        }

        let mut filled = 0;
        let mut ended = false;

        while filled < buf.len() {
            if self.pending.is_empty() {
                match self.data_rx.recv_timeout(READ_POLL) {
                    Ok(chunk) => self.pending.extend_from_slice(&chunk),
                    Err(RecvTimeoutError::Timeout) => {
                        if let Ok(e) = self.error_rx.try_recv() {
                            return Err(e);
                        }
                        ended = !running.load(Ordering::Relaxed);
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        ended = true;
                        break;
                    }
                }
            }

            let n = self.pending.len().min(buf.len() - filled);
            let chunk = self.pending.split_to(n);
            buf[filled..filled + n].copy_from_slice(&chunk);
            filled += n;
        }

        if filled == 0 && ended {
            return Ok(None);
        }
        Ok(Some(filled))
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// State moved into the cpal callbacks
struct StreamContext {
    running: Arc<AtomicBool>,
    data_tx: Sender<Bytes>,
    error_tx: Sender<AudioError>,
    chunks_dropped: Arc<AtomicU64>,
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    ctx: StreamContext,
    encode: F,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    F: Fn(&[T]) -> Bytes + Send + 'static,
{
    let StreamContext {
        running,
        data_tx,
        error_tx,
        chunks_dropped,
    } = ctx;

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            // Full queue means the reader is behind; drop rather than block the device
            if data_tx.try_send(encode(data)).is_err() {
                chunks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )
}
