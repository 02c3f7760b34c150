//! Verba: resilient, credit-metered access to generative-AI inference
//! for a language-tutoring client.
//!
//! # Architecture
//!
//! Three layers compose, leaves first:
//! - **Ledger**: atomic per-user credit store, the single source of
//!   truth for balances
//! - **Dispatcher**: tries inference candidates in priority order with
//!   classified retry/backoff, buffered or streamed
//! - **Metering**: gates requests on the authoritative balance, charges
//!   only on observed success, supports idempotent refunds
//!
//! Live voice calls bypass the metering wrapper: a
//! [`session::VoiceCallSession`] owns one duplex audio channel, keeps
//! playback gapless against a monotonic cursor, and bills the ledger
//! directly once per elapsed minute with a hard cutoff on failure.

pub mod audio;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metering;
pub mod provider;
pub mod session;

pub use config::VerbaConfig;
pub use dispatch::Dispatcher;
pub use error::{Result, VerbaError};
pub use ledger::{AuthoritativeBalance, CachedBalanceHint, LedgerStore, UserId};
pub use metering::{MeterError, MeteredClient, MeteredOperation, UserAccount};
pub use provider::{Candidate, CandidateList, GenerationRequest, RequestOutcome};
pub use session::{CallStatus, VoiceCallSession};
