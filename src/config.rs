//! Configuration types for the metered inference core.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerbaConfig {
    /// Candidate dispatch and retry settings.
    pub dispatch: DispatchConfig,
    /// Credit pricing and grants.
    pub billing: BillingConfig,
    /// Voice-call session settings.
    pub call: CallConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
}

/// Candidate dispatch configuration.
///
/// `candidates` is a priority list, not a set: the first entry is tried
/// first and later entries are fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Ordered inference targets (model identifiers).
    pub candidates: Vec<String>,
    /// Tries per candidate before advancing to the next one.
    pub tries_per_candidate: u32,
    /// Linear backoff step for transient/transport failures, in ms.
    /// The wait for attempt `n` is `n * transient_backoff_ms`.
    pub transient_backoff_ms: u64,
    /// Lower bound of the randomized quota backoff window, in ms.
    pub quota_backoff_min_ms: u64,
    /// Upper bound of the first quota backoff window, in ms. The window
    /// widens with each quota occurrence within one dispatch.
    pub quota_backoff_max_ms: u64,
    /// User-facing text yielded as the terminal fallback chunk when every
    /// candidate fails before producing output.
    pub fallback_message: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            candidates: vec!["primary".to_owned()],
            tries_per_candidate: 3,
            transient_backoff_ms: 1_000,
            quota_backoff_min_ms: 2_000,
            quota_backoff_max_ms: 5_000,
            fallback_message:
                "Sorry, the tutor is unavailable right now. Please try again in a moment."
                    .to_owned(),
        }
    }
}

/// Credit pricing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Credits granted to a newly created account.
    pub welcome_grant: u64,
    /// Cost of one lesson turn (buffered or streamed text generation).
    pub lesson_turn_cost: u64,
    /// Cost of one speech synthesis request.
    pub synthesis_cost: u64,
    /// Cost of one minute of live voice.
    pub voice_minute_cost: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            welcome_grant: 50,
            lesson_turn_cost: 1,
            synthesis_cost: 2,
            voice_minute_cost: 5,
        }
    }
}

/// Voice-call session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Ordered connection profiles for the duplex channel.
    pub candidates: Vec<String>,
    /// Sample rate the inference channel expects, in Hz.
    pub channel_sample_rate: u32,
    /// Lead time added to the first scheduled playback buffer, in ms,
    /// to absorb initial scheduling jitter.
    pub playback_lead_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            candidates: vec!["voice-primary".to_owned()],
            channel_sample_rate: 16_000,
            playback_lead_ms: 100,
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output sample rate in Hz (inbound playback).
    pub output_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: 24_000,
            input_device: None,
            output_device: None,
        }
    }
}

impl VerbaConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| crate::error::VerbaError::Config(format!("cannot read config: {e}")))?;
        toml::from_str(&raw)
            .map_err(|e| crate::error::VerbaError::Config(format!("invalid config: {e}")))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> crate::error::Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VerbaError::Config(format!("cannot serialize: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| crate::error::VerbaError::Config(format!("cannot write config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn default_dispatch_bounds() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.tries_per_candidate, 3);
        assert!(cfg.quota_backoff_min_ms < cfg.quota_backoff_max_ms);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut cfg = VerbaConfig::default();
        cfg.dispatch.candidates = vec!["m1".into(), "m2".into()];
        cfg.billing.voice_minute_cost = 7;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verba.toml");
        cfg.save_to_file(&path).unwrap();

        let loaded = VerbaConfig::from_file(&path).unwrap();
        assert_eq!(loaded.dispatch.candidates, vec!["m1", "m2"]);
        assert_eq!(loaded.billing.voice_minute_cost, 7);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg: VerbaConfig = toml::from_str("[billing]\nwelcome_grant = 10\n").unwrap();
        assert_eq!(cfg.billing.welcome_grant, 10);
        assert_eq!(cfg.billing.lesson_turn_cost, 1);
        assert_eq!(cfg.call.channel_sample_rate, 16_000);
    }
}
