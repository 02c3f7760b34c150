//! cpal-backed microphone and speaker devices (feature `devices`).
//!
//! cpal streams are not `Send`, so each device runs on a dedicated
//! thread that owns the stream; the session talks to it through
//! channels and shared counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::devices::{AudioBlock, MicrophoneSource, SpeakerSink};
use crate::error::{Result, VerbaError};

type ReadySender = std::sync::mpsc::Sender<Result<()>>;

/// Microphone capture via cpal at the device's native rate.
pub struct CpalMicrophone {
    rx: mpsc::Receiver<AudioBlock>,
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CpalMicrophone {
    /// Open the named input device (or the system default).
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available or the stream
    /// cannot be created.
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_worker = Arc::clone(&stop);
        let device_name = device_name.map(str::to_owned);

        let worker = std::thread::spawn(move || {
            run_capture(device_name.as_deref(), tx, &ready_tx, &stop_worker);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                rx,
                stop,
                worker: Some(worker),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VerbaError::Audio("capture thread died during open".into())),
        }
    }
}

/// Build the input stream, signal readiness, then hold the stream alive
/// until asked to stop.
fn run_capture(
    device_name: Option<&str>,
    tx: mpsc::Sender<AudioBlock>,
    ready: &ReadySender,
    stop: &AtomicBool,
) {
    let stream = match build_capture_stream(device_name, tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(VerbaError::Audio(format!(
            "failed to start input stream: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    drop(stream);
}

fn build_capture_stream(
    device_name: Option<&str>,
    tx: mpsc::Sender<AudioBlock>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| VerbaError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VerbaError::Audio(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| VerbaError::Audio("no default input device".into()))?
    };

    let default_config = device
        .default_input_config()
        .map_err(|e| VerbaError::Audio(format!("no default input config: {e}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        "capture device open: {}Hz, {} channels",
        native_rate, native_channels
    );

    device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let block = AudioBlock {
                    samples: mono,
                    sample_rate: native_rate,
                };
                // try_send so the audio thread never blocks.
                if tx.try_send(block).is_err() {
                    warn!("capture channel full, dropping block");
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| VerbaError::Audio(format!("failed to build input stream: {e}")))
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn next_block(&mut self) -> Option<AudioBlock> {
        self.rx.recv().await
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture thread panicked during release");
            }
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.release();
    }
}

/// One scheduled playback buffer, in output-frame coordinates.
struct Scheduled {
    start_frame: u64,
    samples: Vec<f32>,
    position: usize,
}

/// Shared playback state between the session and the stream callback.
#[derive(Default)]
struct PlaybackQueue {
    buffers: VecDeque<Scheduled>,
}

/// Speaker playback via cpal with a frame-counter clock.
pub struct CpalSpeaker {
    queue: Arc<Mutex<PlaybackQueue>>,
    frames_played: Arc<AtomicU64>,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CpalSpeaker {
    /// Open the named output device (or the system default) at the given
    /// rate.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be created.
    pub fn open(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let queue = Arc::new(Mutex::new(PlaybackQueue::default()));
        let frames_played = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let queue_worker = Arc::clone(&queue);
        let frames_worker = Arc::clone(&frames_played);
        let stop_worker = Arc::clone(&stop);
        let device_name = device_name.map(str::to_owned);

        let worker = std::thread::spawn(move || {
            run_playback(
                device_name.as_deref(),
                sample_rate,
                queue_worker,
                frames_worker,
                &ready_tx,
                &stop_worker,
            );
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                frames_played,
                sample_rate,
                stop,
                worker: Some(worker),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VerbaError::Audio("playback thread died during open".into())),
        }
    }
}

fn run_playback(
    device_name: Option<&str>,
    sample_rate: u32,
    queue: Arc<Mutex<PlaybackQueue>>,
    frames_played: Arc<AtomicU64>,
    ready: &ReadySender,
    stop: &AtomicBool,
) {
    let stream = match build_playback_stream(device_name, sample_rate, queue, frames_played) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(VerbaError::Audio(format!(
            "failed to start output stream: {e}"
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    drop(stream);
}

fn build_playback_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    queue: Arc<Mutex<PlaybackQueue>>,
    frames_played: Arc<AtomicU64>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| VerbaError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VerbaError::Audio(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| VerbaError::Audio("no default output device".into()))?
    };

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut frame = frames_played.load(Ordering::Relaxed);
                let mut queue = match queue.lock() {
                    Ok(q) => q,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    *sample = next_playback_sample(&mut queue, frame);
                    frame += 1;
                }
                frames_played.store(frame, Ordering::Relaxed);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| VerbaError::Audio(format!("failed to build output stream: {e}")))
}

/// Produce the next output sample at absolute frame `frame`.
///
/// Buffers are scheduled with non-overlapping, non-decreasing start
/// frames, so only the front of the queue can be active.
fn next_playback_sample(queue: &mut PlaybackQueue, frame: u64) -> f32 {
    while let Some(front) = queue.buffers.front_mut() {
        if front.position >= front.samples.len() {
            queue.buffers.pop_front();
            continue;
        }
        if front.start_frame + front.position as u64 > frame {
            return 0.0;
        }
        let sample = front.samples[front.position];
        front.position += 1;
        return sample;
    }
    0.0
}

impl SpeakerSink for CpalSpeaker {
    fn clock(&self) -> f64 {
        self.frames_played.load(Ordering::Relaxed) as f64 / f64::from(self.sample_rate)
    }

    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) {
        let samples = if sample_rate == self.sample_rate {
            samples
        } else {
            resample_linear(&samples, sample_rate, self.sample_rate)
        };
        let start_frame = (start_at * f64::from(self.sample_rate)) as u64;
        if let Ok(mut queue) = self.queue.lock() {
            queue.buffers.push_back(Scheduled {
                start_frame,
                samples,
                position: 0,
            });
        }
    }

    fn flush(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.buffers.clear();
        }
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("playback thread panicked during release");
            }
        }
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.release();
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = usize::from(channels);
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation rate conversion for playback buffers.
fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}
