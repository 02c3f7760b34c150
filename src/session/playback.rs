//! Gapless playback scheduling against a monotonic output clock.

/// Assigns start times to incoming audio buffers so consecutive buffers
/// play back-to-back with no gaps and no overlap.
///
/// The cursor only moves forward: a buffer starts at the later of the
/// current output clock and the end of the previously scheduled buffer.
/// The very first buffer gets a small lead so the device has time to
/// fill its ring before playback begins.
#[derive(Debug)]
pub struct PlaybackScheduler {
    cursor: f64,
    lead: f64,
    started: bool,
}

impl PlaybackScheduler {
    /// Create a scheduler with the given first-buffer lead in seconds.
    pub fn new(lead_secs: f64) -> Self {
        Self {
            cursor: 0.0,
            lead: lead_secs,
            started: false,
        }
    }

    /// Schedule a buffer of `duration` seconds given the current output
    /// clock `now`, returning the absolute start time.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let earliest = if self.started { now } else { now + self.lead };
        self.started = true;
        let start = earliest.max(self.cursor);
        self.cursor = start + duration;
        start
    }

    /// Seconds of audio scheduled beyond the given clock value.
    pub fn backlog(&self, now: f64) -> f64 {
        (self.cursor - now).max(0.0)
    }

    /// Forget all scheduled audio, as when the remote end interrupts
    /// its own reply. The cursor moves to the current output clock, so
    /// the next buffer cannot land behind audio already handed to the
    /// device.
    pub fn reset(&mut self, now: f64) {
        self.cursor = now;
        self.started = false;
    }
}
