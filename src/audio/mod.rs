//! Audio primitives: PCM encoding, downsampling, and device seams.

pub mod devices;
pub mod encode;

#[cfg(feature = "devices")]
pub mod cpal_io;

pub use devices::{AudioBlock, MicrophoneSource, SpeakerSink};
pub use encode::{decode_pcm_frame, encode_pcm_frame, resample_to_rate, rms_level};
