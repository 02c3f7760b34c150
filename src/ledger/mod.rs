//! Atomic per-user credit ledger.
//!
//! The ledger is the single source of truth for balances. Gating
//! decisions must use an [`AuthoritativeBalance`] fetched at the moment
//! of the decision; [`CachedBalanceHint`] exists only for optimistic UI
//! and cannot be passed where a gate expects authority.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;

/// Non-negative credit amount.
pub type Credits = u64;

/// Opaque user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A balance value fetched from the authoritative store.
///
/// Only [`LedgerStore`] implementations construct this; holding one
/// means the value was re-fetched for the current gating decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthoritativeBalance {
    credits: Credits,
}

impl AuthoritativeBalance {
    /// Wrap a freshly read balance. For ledger implementations.
    pub fn new(credits: Credits) -> Self {
        Self { credits }
    }

    /// The credit amount.
    pub fn credits(&self) -> Credits {
        self.credits
    }

    /// Whether this balance covers the given cost.
    pub fn covers(&self, cost: Credits) -> bool {
        self.credits >= cost
    }
}

/// A stale, non-authoritative balance mirror for optimistic UI.
///
/// Deliberately not convertible into [`AuthoritativeBalance`]: no code
/// path can gate a paid action on a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedBalanceHint {
    /// Last observed credit amount.
    pub credits: Credits,
    /// When the value was observed.
    pub as_of: DateTime<Utc>,
}

impl CachedBalanceHint {
    /// Record an observation made now.
    pub fn observed(credits: Credits) -> Self {
        Self {
            credits,
            as_of: Utc::now(),
        }
    }
}

impl From<AuthoritativeBalance> for CachedBalanceHint {
    fn from(balance: AuthoritativeBalance) -> Self {
        Self::observed(balance.credits())
    }
}

/// Ledger store errors.
///
/// An error from [`LedgerStore::try_deduct`] means the charge outcome is
/// unknown; callers must fail closed and not grant the operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// The store could not be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// No account exists for the user.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// Underlying storage failure.
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Atomic balance store keyed by user id.
///
/// `try_deduct` must be an indivisible check-and-decrement against the
/// authoritative store: two concurrent deductions for the same user may
/// never both observe the pre-deduction balance.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create an account with a welcome grant. Idempotent: re-creating an
    /// existing account leaves its balance untouched.
    async fn create_account(&self, user: &UserId, welcome: Credits) -> Result<(), LedgerError>;

    /// Re-fetch the authoritative balance.
    async fn balance(&self, user: &UserId) -> Result<AuthoritativeBalance, LedgerError>;

    /// Atomically deduct `amount` if the balance covers it.
    ///
    /// Returns `false` (and leaves the balance untouched) when funds are
    /// insufficient.
    async fn try_deduct(&self, user: &UserId, amount: Credits) -> Result<bool, LedgerError>;

    /// Credit `amount` to the user's balance.
    async fn credit(&self, user: &UserId, amount: Credits) -> Result<(), LedgerError>;
}
