//! Live voice-call session.
//!
//! A [`VoiceCallSession`] owns a duplex channel to one inference
//! candidate plus the microphone and speaker for the duration of a call.
//! It multiplexes three flows in a single task: capture → encode → send,
//! receive → decode → scheduled playback, and a 1-second billing tick
//! that deducts one minute's cost every 60 elapsed seconds. Failures
//! become state transitions, never panics: there is no synchronous
//! caller waiting once the call is up.

pub mod channel;
pub mod playback;
pub mod ws;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use channel::{InboundEvent, OutboundAudioFrame, VoiceChannel, VoiceConnector};
pub use playback::PlaybackScheduler;
pub use ws::WsVoiceConnector;

use crate::audio::devices::{MicrophoneSource, SpeakerSink};
use crate::audio::encode::{decode_pcm_frame, encode_pcm_frame, resample_to_rate, rms_level};
use crate::config::{BillingConfig, CallConfig};
use crate::ledger::{LedgerError, LedgerStore, UserId};
use crate::provider::{Candidate, FailureKind};

/// Call lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    /// No call yet.
    Idle,
    /// Balance checked, first minute charged, channel being opened.
    Connecting,
    /// Duplex channel confirmed open.
    Connected,
    /// Normal hangup path.
    Closed,
    /// Terminal failure with a human-readable reason. The user must
    /// explicitly redial; there is no silent retry loop.
    Error(String),
}

impl CallStatus {
    /// Whether the call has ended (normally or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }
}

/// Why a call could not start.
#[derive(Debug, thiserror::Error)]
pub enum CallStartError {
    /// The balance does not cover the pre-paid first minute.
    #[error("insufficient credits for a voice call")]
    InsufficientFunds,
    /// Another session owns the audio devices and has not finished
    /// teardown.
    #[error("another voice session is still active")]
    SessionActive,
    /// The ledger could not confirm the first-minute charge.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// At most one session may own the audio devices per process.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Releases the process-wide slot on drop, so a panicking call task
/// still lets the next call start.
struct SessionSlot;

impl SessionSlot {
    fn acquire() -> Option<Self> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(Self)
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

/// Collaborators a call needs.
///
/// Devices are opened before the call starts; a microphone or speaker
/// that cannot be acquired fails the whole operation up front, before
/// any candidate is tried.
pub struct CallDeps {
    /// Authoritative balance store for per-minute billing.
    pub ledger: Arc<dyn LedgerStore>,
    /// Opens the duplex channel per candidate.
    pub connector: Arc<dyn VoiceConnector>,
    /// Capture device, already open.
    pub microphone: Box<dyn MicrophoneSource>,
    /// Playback device, already open.
    pub speaker: Box<dyn SpeakerSink>,
}

/// Handle to a running voice call.
pub struct VoiceCallSession {
    status_rx: watch::Receiver<CallStatus>,
    level_rx: watch::Receiver<f32>,
    muted: Arc<AtomicBool>,
    elapsed_secs: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl VoiceCallSession {
    /// Start a call for `user`.
    ///
    /// Checks the balance and charges the first minute before anything
    /// touches the network; the session then connects and runs in a
    /// background task, reporting progress through [`Self::watch_status`].
    ///
    /// # Errors
    ///
    /// Fails fast when another session is active, the balance does not
    /// cover the first minute, or the ledger cannot confirm the charge.
    pub async fn start(
        user: UserId,
        mut deps: CallDeps,
        call: CallConfig,
        billing: &BillingConfig,
    ) -> Result<Self, CallStartError> {
        let Some(slot) = SessionSlot::acquire() else {
            deps.microphone.release();
            deps.speaker.release();
            return Err(CallStartError::SessionActive);
        };

        let minute_cost = billing.voice_minute_cost;
        // The first minute is pre-paid: no audio flows before it clears.
        let charged = match deps.ledger.try_deduct(&user, minute_cost).await {
            Ok(charged) => charged,
            Err(e) => {
                deps.microphone.release();
                deps.speaker.release();
                drop(slot);
                return Err(CallStartError::Ledger(e));
            }
        };
        if !charged {
            deps.microphone.release();
            deps.speaker.release();
            drop(slot);
            return Err(CallStartError::InsufficientFunds);
        }

        let (status_tx, status_rx) = watch::channel(CallStatus::Connecting);
        let (level_tx, level_rx) = watch::channel(0.0_f32);
        let muted = Arc::new(AtomicBool::new(false));
        let elapsed_secs = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_call(CallTask {
            user,
            deps,
            call,
            minute_cost,
            status_tx,
            level_tx,
            muted: Arc::clone(&muted),
            elapsed_secs: Arc::clone(&elapsed_secs),
            cancel: cancel.clone(),
            slot,
        }));

        Ok(Self {
            status_rx,
            level_rx,
            muted,
            elapsed_secs,
            cancel,
            task: Some(task),
        })
    }

    /// Current call status.
    pub fn status(&self) -> CallStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status_rx.clone()
    }

    /// Watch the microphone RMS level (updates even while muted).
    pub fn watch_level(&self) -> watch::Receiver<f32> {
        self.level_rx.clone()
    }

    /// Seconds the call has been connected.
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_secs.load(Ordering::Relaxed)
    }

    /// Mute or unmute the outbound path. A muted session still captures
    /// for level metering but transmits nothing.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Whether the outbound path is muted.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Hang up. Idempotent; teardown happens in the call task and the
    /// status settles on [`CallStatus::Closed`].
    pub fn hangup(&self) {
        self.cancel.cancel();
    }

    /// Hang up and wait for teardown to finish.
    pub async fn hangup_and_wait(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                warn!("call task panicked during teardown");
            }
        }
    }
}

impl Drop for VoiceCallSession {
    fn drop(&mut self) {
        // Unmount without hangup still ends the call; the task owns
        // teardown and the session slot.
        self.cancel.cancel();
    }
}

struct CallTask {
    user: UserId,
    deps: CallDeps,
    call: CallConfig,
    minute_cost: u64,
    status_tx: watch::Sender<CallStatus>,
    level_tx: watch::Sender<f32>,
    muted: Arc<AtomicBool>,
    elapsed_secs: Arc<AtomicU64>,
    cancel: CancellationToken,
    slot: SessionSlot,
}

async fn run_call(task: CallTask) {
    let CallTask {
        user,
        deps,
        call,
        minute_cost,
        status_tx,
        level_tx,
        muted,
        elapsed_secs,
        cancel,
        slot,
    } = task;
    let CallDeps {
        ledger,
        connector,
        mut microphone,
        mut speaker,
    } = deps;

    let mut channel = match connect_any(connector.as_ref(), &call, &cancel).await {
        Ok(channel) => {
            let _ = status_tx.send(CallStatus::Connected);
            channel
        }
        Err(reason) => {
            let _ = status_tx.send(if cancel.is_cancelled() {
                CallStatus::Closed
            } else {
                CallStatus::Error(reason)
            });
            microphone.release();
            speaker.release();
            drop(slot);
            return;
        }
    };

    let lead_secs = call.playback_lead_ms as f64 / 1000.0;
    let mut scheduler = PlaybackScheduler::new(lead_secs);
    let tick = Duration::from_secs(1);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);

    let final_status = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                break CallStatus::Closed;
            }

            block = microphone.next_block() => {
                let Some(block) = block else {
                    break CallStatus::Error("microphone stopped".to_owned());
                };
                let _ = level_tx.send(rms_level(&block.samples));
                if muted.load(Ordering::Relaxed) {
                    continue;
                }
                let samples = resample_to_rate(
                    &block.samples,
                    block.sample_rate,
                    call.channel_sample_rate,
                );
                let frame = OutboundAudioFrame {
                    pcm_b64: encode_pcm_frame(&samples),
                    sample_rate: call.channel_sample_rate,
                };
                if let Err(e) = channel.send_audio(frame).await {
                    break CallStatus::Error(format!("call dropped: {e}"));
                }
            }

            event = channel.next_event() => {
                match event {
                    Some(InboundEvent::Audio { pcm_b64, sample_rate }) => {
                        match decode_pcm_frame(&pcm_b64) {
                            Ok(samples) => {
                                let duration =
                                    samples.len() as f64 / f64::from(sample_rate);
                                let start = scheduler.schedule(speaker.clock(), duration);
                                speaker.schedule(samples, sample_rate, start);
                            }
                            Err(e) => warn!("dropping undecodable audio frame: {e}"),
                        }
                    }
                    Some(InboundEvent::TurnComplete) => {
                        debug!("remote turn complete");
                    }
                    Some(InboundEvent::Interrupted) => {
                        debug!("remote reply interrupted, dropping queued playback");
                        speaker.flush();
                        scheduler.reset(speaker.clock());
                    }
                    Some(InboundEvent::Closed) | None => {
                        break CallStatus::Closed;
                    }
                    Some(InboundEvent::Error(msg)) => {
                        break CallStatus::Error(format!("call failed: {msg}"));
                    }
                }
            }

            _ = ticker.tick() => {
                let elapsed = elapsed_secs.fetch_add(1, Ordering::Relaxed) + 1;
                if elapsed % 60 == 0 {
                    // Minute N is billed before minute N+1 of service.
                    match ledger.try_deduct(&user, minute_cost).await {
                        Ok(true) => {
                            debug!(elapsed, "voice minute billed");
                        }
                        Ok(false) => {
                            info!(elapsed, "credits exhausted, ending call");
                            break CallStatus::Error("out of credits".to_owned());
                        }
                        Err(e) => {
                            // Charge outcome unknown: fail closed.
                            warn!("minute billing failed: {e}");
                            break CallStatus::Error(format!("billing failed: {e}"));
                        }
                    }
                }
            }
        }
    };

    // Teardown runs unconditionally and swallows device errors; nothing
    // here may reach a caller.
    microphone.release();
    speaker.release();
    channel.close().await;
    let _ = status_tx.send(final_status);
    drop(slot);
}

/// Open a channel against the first candidate that accepts.
///
/// Quota and transient open failures advance to the next candidate; a
/// fatal failure also advances, since another endpoint may still accept
/// the call. Devices were already acquired, so the one genuinely
/// unrecoverable class (no microphone) never reaches this loop.
async fn connect_any(
    connector: &dyn VoiceConnector,
    call: &CallConfig,
    cancel: &CancellationToken,
) -> Result<Box<dyn VoiceChannel>, String> {
    let mut last_failure = "no voice candidates configured".to_owned();
    for id in &call.candidates {
        let candidate = Candidate::new(id.clone());
        // Hangup must interrupt a connect in flight, not wait it out.
        let connected = tokio::select! {
            () = cancel.cancelled() => return Err("cancelled".to_owned()),
            connected = connector.connect(&candidate) => connected,
        };
        match connected {
            Ok(channel) => {
                info!(candidate = %candidate, "voice channel connected");
                return Ok(channel);
            }
            Err(failure) => {
                match failure.kind {
                    FailureKind::QuotaExceeded => {
                        warn!(candidate = %candidate, "candidate over quota, advancing");
                    }
                    _ => {
                        warn!(candidate = %candidate, "voice connect failed: {failure}");
                    }
                }
                last_failure = failure.message;
            }
        }
    }
    Err(format!("all candidates exhausted: {last_failure}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn terminal_states() {
        assert!(CallStatus::Closed.is_terminal());
        assert!(CallStatus::Error("x".into()).is_terminal());
        assert!(!CallStatus::Connecting.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
        assert!(!CallStatus::Idle.is_terminal());
    }

    #[test]
    fn session_slot_is_exclusive_and_released_on_drop() {
        let first = SessionSlot::acquire().unwrap();
        assert!(SessionSlot::acquire().is_none());
        drop(first);
        let again = SessionSlot::acquire().unwrap();
        drop(again);
    }
}
