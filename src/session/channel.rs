//! Duplex voice channel seam.
//!
//! A [`VoiceConnector`] opens one [`VoiceChannel`] per candidate. The
//! channel exchanges base64-encoded 16-bit PCM frames and surfaces
//! turn-boundary signals; the session owns encode/decode on either side.

use async_trait::async_trait;

use crate::provider::{Candidate, ProviderFailure};

/// One outbound microphone frame, already downsampled and encoded.
#[derive(Debug, Clone)]
pub struct OutboundAudioFrame {
    /// Base64-encoded little-endian 16-bit PCM.
    pub pcm_b64: String,
    pub sample_rate: u32,
}

/// Events arriving from the remote end of the channel.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A burst of synthesized speech.
    Audio {
        /// Base64-encoded little-endian 16-bit PCM.
        pcm_b64: String,
        sample_rate: u32,
    },
    /// The remote speaker finished its turn.
    TurnComplete,
    /// The remote side interrupted its own reply; queued playback for
    /// the current turn should be dropped.
    Interrupted,
    /// The channel was closed by the remote end.
    Closed,
    /// A channel-level failure; the session treats this as terminal.
    Error(String),
}

/// An open duplex channel to one inference candidate.
#[async_trait]
pub trait VoiceChannel: Send {
    /// Send one microphone frame upstream.
    async fn send_audio(&mut self, frame: OutboundAudioFrame) -> Result<(), ProviderFailure>;

    /// Await the next inbound event. `None` means the channel is done
    /// and no further events will arrive.
    async fn next_event(&mut self) -> Option<InboundEvent>;

    /// Close the channel. Must not fail; close errors are logged and
    /// swallowed.
    async fn close(&mut self);
}

/// Opens voice channels. Failures carry the same classification the
/// request path uses, so the session can decide whether to advance to
/// the next candidate.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, candidate: &Candidate)
        -> Result<Box<dyn VoiceChannel>, ProviderFailure>;
}
