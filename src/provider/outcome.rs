//! Failure classification for provider attempts.
//!
//! Classification happens at the lowest level — the single try against
//! one candidate. The dispatcher only ever sees a [`FailureKind`], never
//! a raw transport error.

use serde::{Deserialize, Serialize};

/// How a single provider attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider explicitly signalled over-limit or forbidden for this
    /// candidate. The candidate is temporarily out of capacity; the
    /// request itself is not invalid.
    QuotaExceeded,
    /// 5xx-class server failure.
    TransientServer,
    /// Connection or timeout failure before/while talking to the provider.
    Transport,
    /// Anything else, including malformed-input rejections.
    Fatal,
}

impl FailureKind {
    /// Whether the same candidate may be retried after this failure.
    ///
    /// Quota failures are not retried on the same candidate — quota
    /// exhaustion on one candidate does not imply exhaustion on another,
    /// so the dispatcher advances instead.
    pub fn retryable_same_candidate(&self) -> bool {
        matches!(self, Self::TransientServer | Self::Transport)
    }
}

/// A classified failure from one provider attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderFailure {
    /// Failure class driving the retry decision.
    pub kind: FailureKind,
    /// Human-readable description for logs and end-of-call reasons.
    pub message: String,
}

impl ProviderFailure {
    /// Create a failure of the given class.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a quota/rate-limit failure.
    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(FailureKind::QuotaExceeded, message)
    }

    /// Shorthand for a transient 5xx failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientServer, message)
    }

    /// Shorthand for a connection/timeout failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    /// Shorthand for a fatal failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }
}

/// Outcome of one logical request, produced per attempt and consumed by
/// the dispatcher's control loop.
#[derive(Debug, Clone)]
pub enum RequestOutcome<T> {
    /// The attempt produced a payload.
    Success(T),
    /// The attempt failed in a way that permits further attempts.
    RetryableFailure(ProviderFailure),
    /// The attempt failed terminally for this dispatch.
    FatalFailure(ProviderFailure),
}

impl<T> RequestOutcome<T> {
    /// Extract the success payload, if any.
    pub fn into_success(self) -> Option<T> {
        match self {
            Self::Success(payload) => Some(payload),
            _ => None,
        }
    }

    /// Whether this outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}
