//! Device seams for the voice session.
//!
//! The session owns at most one microphone and one speaker for its
//! lifetime. These traits let the session run against real cpal devices
//! (feature `devices`) or test fakes with a simulated clock.

use async_trait::async_trait;

/// A block of mono f32 samples at the source's native rate.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Mono samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Microphone capture seam.
///
/// `release` must be infallible and idempotent: teardown calls it
/// unconditionally and must never propagate a device error.
#[async_trait]
pub trait MicrophoneSource: Send {
    /// Await the next captured block. `None` when the device stops
    /// producing (unplugged, released).
    async fn next_block(&mut self) -> Option<AudioBlock>;

    /// Stop capture and release the device.
    fn release(&mut self);
}

/// Speaker playback seam.
///
/// The session computes buffer start times against this sink's clock;
/// the sink only has to honour them.
pub trait SpeakerSink: Send {
    /// Current playback clock, in seconds. Monotonic.
    fn clock(&self) -> f64;

    /// Schedule a buffer to start playing at `start_at` (seconds on this
    /// sink's clock).
    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64);

    /// Drop all scheduled audio, played or pending, as when the remote
    /// end interrupts its own reply. The clock keeps running.
    fn flush(&mut self);

    /// Stop playback and release the device. Infallible, idempotent.
    fn release(&mut self);
}
