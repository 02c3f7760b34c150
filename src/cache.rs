//! Process-local profile mirror for optimistic UI.
//!
//! Holds the last known balance per user as a [`CachedBalanceHint`].
//! The hint type cannot be passed where a gate expects an
//! [`AuthoritativeBalance`](crate::ledger::AuthoritativeBalance), so this
//! cache can never back a paid-action decision.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::ledger::{CachedBalanceHint, Credits, UserId};

/// Last-known profile/balance mirror.
#[derive(Debug, Default)]
pub struct ProfileCache {
    balances: RwLock<HashMap<UserId, CachedBalanceHint>>,
}

impl ProfileCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed balance.
    pub fn record(&self, user: &UserId, credits: Credits) {
        if let Ok(mut balances) = self.balances.write() {
            balances.insert(user.clone(), CachedBalanceHint::observed(credits));
        }
    }

    /// The last observed balance hint, if any.
    pub fn hint(&self, user: &UserId) -> Option<CachedBalanceHint> {
        self.balances.read().ok()?.get(user).copied()
    }

    /// Forget a user's entry (logout, account deletion).
    pub fn evict(&self, user: &UserId) {
        if let Ok(mut balances) = self.balances.write() {
            balances.remove(user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_hints() {
        let cache = ProfileCache::new();
        let user = UserId::new("u");
        assert!(cache.hint(&user).is_none());

        cache.record(&user, 42);
        assert_eq!(cache.hint(&user).map(|h| h.credits), Some(42));

        cache.evict(&user);
        assert!(cache.hint(&user).is_none());
    }
}
