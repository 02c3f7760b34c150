//! Sample-rate conversion and wire encoding for voice frames.
//!
//! The inference channel takes 16-bit signed PCM at a fixed rate,
//! base64-encoded. Capture runs at the device's native rate, so outbound
//! audio is rate-converted first: decimation by block averaging (each
//! output sample is the mean of its span of inputs) when the device runs
//! faster than the channel, linear interpolation when it runs slower. No
//! anti-alias filter — voice bandwidth tolerates plain decimation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Result, VerbaError};

/// Convert a sample block to `dst_rate`.
///
/// Block-averages when decimating, linearly interpolates when the source
/// runs below the target rate. Returns the input unchanged when the
/// rates match, so the caller may always label the result with
/// `dst_rate`.
pub fn resample_to_rate(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * u64::from(dst_rate) / u64::from(src_rate)) as usize;
    let mut output = Vec::with_capacity(out_len);

    if dst_rate > src_rate {
        let ratio = f64::from(src_rate) / f64::from(dst_rate);
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
        return output;
    }

    for i in 0..out_len {
        let start = (i as u64 * u64::from(src_rate) / u64::from(dst_rate)) as usize;
        let end = (((i as u64 + 1) * u64::from(src_rate)) / u64::from(dst_rate)) as usize;
        let end = end.clamp(start + 1, samples.len());
        let span = &samples[start.min(samples.len() - 1)..end];
        let sum: f32 = span.iter().sum();
        output.push(sum / span.len() as f32);
    }

    output
}

/// Convert f32 samples in [-1, 1] to little-endian 16-bit signed PCM.
pub fn f32_to_i16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let value = (clamped * f32::from(i16::MAX)) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert little-endian 16-bit signed PCM back to f32 samples.
pub fn i16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            f32::from(value) / f32::from(i16::MAX)
        })
        .collect()
}

/// Encode f32 samples as a base64 PCM frame for transmission.
pub fn encode_pcm_frame(samples: &[f32]) -> String {
    BASE64.encode(f32_to_i16_le(samples))
}

/// Decode a base64 PCM frame into f32 samples.
///
/// # Errors
///
/// Returns an error if the frame is not valid base64.
pub fn decode_pcm_frame(frame: &str) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(frame)
        .map_err(|e| VerbaError::Audio(format!("invalid base64 audio frame: {e}")))?;
    Ok(i16_le_to_f32(&bytes))
}

/// RMS level of a sample block, for UI level metering.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn downsample_averages_blocks() {
        // 48k -> 16k: each output sample averages 3 inputs.
        let input = vec![0.0, 0.3, 0.6, 1.0, 1.0, 1.0];
        let out = resample_to_rate(&input, 48_000, 16_000);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn resample_noop_on_equal_rates() {
        let input = vec![0.1, 0.2];
        assert_eq!(resample_to_rate(&input, 16_000, 16_000), input);
    }

    #[test]
    fn downsample_handles_non_integer_ratio() {
        let input: Vec<f32> = (0..441).map(|i| i as f32 / 441.0).collect();
        let out = resample_to_rate(&input, 44_100, 16_000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn upsample_interpolates_to_the_channel_rate() {
        // A slow device (8k) must not be passed through mislabelled:
        // 8k -> 16k doubles the sample count.
        let input = vec![0.0, 1.0];
        let out = resample_to_rate(&input, 8_000, 16_000);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
        assert!((out[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pcm_round_trip_preserves_shape() {
        let input = vec![0.0, 0.5, -0.5, 1.0, -1.0];
        let decoded = i16_le_to_f32(&f32_to_i16_le(&input));
        assert_eq!(decoded.len(), input.len());
        for (a, b) in input.iter().zip(&decoded) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn i16_conversion_clamps_out_of_range() {
        let bytes = f32_to_i16_le(&[2.0, -2.0]);
        let decoded = i16_le_to_f32(&bytes);
        assert!((decoded[0] - 1.0).abs() < 1e-3);
        assert!((decoded[1] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn frame_round_trip() {
        let samples = vec![0.25, -0.25, 0.0];
        let frame = encode_pcm_frame(&samples);
        let decoded = decode_pcm_frame(&frame).unwrap();
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn bad_frame_errors() {
        assert!(decode_pcm_frame("not-base64!!").is_err());
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_level(&[0.0; 64]), 0.0);
        assert_eq!(rms_level(&[]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal() {
        let level = rms_level(&[0.5; 256]);
        assert!((level - 0.5).abs() < 1e-6);
    }
}
