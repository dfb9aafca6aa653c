//! Audio playback to output devices

use bytes::{Bytes, BytesMut};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::get_device_by_id;
use crate::audio::pcm::{fill_f32_from_i16, fill_f32_from_i8, fill_i16, fill_i8};
use crate::audio::PlaybackLine;
use crate::config::AudioFormat;
use crate::error::AudioError;

/// Upper bound on how long `drain` waits for the device
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a write waits on a full queue before giving the device up
const WRITE_STALL: Duration = Duration::from_secs(2);

/// Chunks buffered between writer and callback
const PLAYBACK_QUEUE_CHUNKS: usize = 256;

/// Playback line on a cpal output device
pub struct CpalPlaybackLine {
    device_id: String,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    data_tx: Option<Sender<Bytes>>,
    error_rx: Receiver<AudioError>,

    /// Bytes written but not yet handed to the device
    queued: Arc<AtomicUsize>,

    /// Writes block while more than this many bytes are queued
    queue_limit: usize,
}

impl CpalPlaybackLine {
    /// Open the device and start playback
    pub fn open(device_id: &str, format: &AudioFormat, buffer_bytes: usize) -> Result<Self, AudioError> {
        let device = get_device_by_id(device_id)?;
        let (config, sample_format) = device.stream_config(format, buffer_bytes)?;

        let (data_tx, data_rx) = bounded::<Bytes>(PLAYBACK_QUEUE_CHUNKS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let bit_depth = format.bit_depth;
        let queued = Arc::new(AtomicUsize::new(0));
        let stream_ctx = StreamContext {
            running: running.clone(),
            data_rx,
            error_tx,
            queued: queued.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("playback-{}", device_id))
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = match (sample_format, bit_depth) {
                    (SampleFormat::I8, _) => build_stream::<i8, _>(&cpal_device, &config, stream_ctx, 1, fill_i8),
                    (SampleFormat::F32, 8) => {
                        build_stream::<f32, _>(&cpal_device, &config, stream_ctx, 1, fill_f32_from_i8)
                    }
                    (SampleFormat::F32, _) => {
                        build_stream::<f32, _>(&cpal_device, &config, stream_ctx, 2, fill_f32_from_i16)
                    }
                    _ => build_stream::<i16, _>(&cpal_device, &config, stream_ctx, 2, fill_i16),
                };

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));

                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    }
                }
            })
            .map_err(|e| AudioError::Worker(e.to_string()))?;

        let ready = ready_rx
            .recv_timeout(OPEN_TIMEOUT)
            .unwrap_or_else(|_| Err(AudioError::Worker("playback thread did not start".into())));

        let mut line = Self {
            device_id: device_id.to_string(),
            running,
            thread_handle: Some(handle),
            data_tx: Some(data_tx),
            error_rx,
            queued,
            queue_limit: buffer_bytes.max(1),
        };

        if let Err(e) = ready {
            line.stop();
            return Err(e);
        }

        tracing::info!(
            "Playback opened on {}: {} Hz, {} bit, {} ch",
            device_id,
            format.sample_rate,
            format.bit_depth,
            format.channels
        );
        Ok(line)
    }

    /// Bytes waiting to be played
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

impl PlaybackLine for CpalPlaybackLine {
    fn write(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        if let Ok(e) = self.error_rx.try_recv() {
            return Err(e);
        }
        let tx = self.data_tx.as_ref().ok_or(AudioError::LineClosed)?;

        // Block like a hardware line would while the device catches up
        let deadline = Instant::now() + WRITE_STALL;
        while self.running.load(Ordering::Relaxed)
            && self.queued.load(Ordering::Relaxed) + data.len() > self.queue_limit.max(data.len())
        {
            if Instant::now() >= deadline {
                return Err(AudioError::Stalled(self.device_id.clone()));
            }
            thread::sleep(Duration::from_millis(1));
        }
        if !self.running.load(Ordering::Relaxed) {
            return Err(AudioError::LineClosed);
        }

        self.queued.fetch_add(data.len(), Ordering::Relaxed);
        if tx.send(Bytes::copy_from_slice(data)).is_err() {
            self.queued.fetch_sub(data.len(), Ordering::Relaxed);
            return Err(AudioError::LineClosed);
        }
        Ok(data.len())
    }

    fn drain(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.running.load(Ordering::Relaxed)
            && self.queued.load(Ordering::Relaxed) > 0
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Playback stopped on {}", self.device_id);
        }
    }

    fn close(&mut self) {
        self.stop();
        self.data_tx = None;
        self.queued.store(0, Ordering::Relaxed);
    }
}

impl Drop for CpalPlaybackLine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the cpal callbacks
struct StreamContext {
    running: Arc<AtomicBool>,
    data_rx: Receiver<Bytes>,
    error_tx: Sender<AudioError>,
    queued: Arc<AtomicUsize>,
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    ctx: StreamContext,
    bytes_per_sample: usize,
    fill: F,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    F: Fn(&mut [T], &mut BytesMut) -> usize + Send + 'static,
{
    let StreamContext {
        running,
        data_rx,
        error_tx,
        queued,
    } = ctx;
    let mut pending = BytesMut::new();

    device.build_output_stream(
        config,
        move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
            if running.load(Ordering::Relaxed) {
                let needed = out.len() * bytes_per_sample;
                while pending.len() < needed {
                    match data_rx.try_recv() {
                        Ok(chunk) => pending.extend_from_slice(&chunk),
                        Err(_) => break,
                    }
                }
            }
            // Underruns play silence
            let consumed = fill(out, &mut pending);
            queued.fetch_sub(consumed.min(queued.load(Ordering::Relaxed)), Ordering::Relaxed);
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )
}
