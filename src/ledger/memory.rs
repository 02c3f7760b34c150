//! In-memory ledger store.
//!
//! A single mutex over the account map makes every operation atomic
//! relative to concurrent callers. Used by tests and offline hosts; the
//! sqlite store is the durable sibling.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AuthoritativeBalance, Credits, LedgerError, LedgerStore, UserId};

/// In-memory atomic credit ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    accounts: Mutex<HashMap<UserId, Credits>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger pre-seeded with one account.
    pub async fn with_account(user: &UserId, credits: Credits) -> Self {
        let ledger = Self::new();
        ledger.accounts.lock().await.insert(user.clone(), credits);
        ledger
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_account(&self, user: &UserId, welcome: Credits) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.lock().await;
        accounts.entry(user.clone()).or_insert(welcome);
        Ok(())
    }

    async fn balance(&self, user: &UserId) -> Result<AuthoritativeBalance, LedgerError> {
        let accounts = self.accounts.lock().await;
        accounts
            .get(user)
            .map(|credits| AuthoritativeBalance::new(*credits))
            .ok_or_else(|| LedgerError::UnknownUser(user.to_string()))
    }

    async fn try_deduct(&self, user: &UserId, amount: Credits) -> Result<bool, LedgerError> {
        let mut accounts = self.accounts.lock().await;
        let credits = accounts
            .get_mut(user)
            .ok_or_else(|| LedgerError::UnknownUser(user.to_string()))?;
        if *credits < amount {
            return Ok(false);
        }
        *credits -= amount;
        Ok(true)
    }

    async fn credit(&self, user: &UserId, amount: Credits) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.lock().await;
        let credits = accounts
            .get_mut(user)
            .ok_or_else(|| LedgerError::UnknownUser(user.to_string()))?;
        *credits = credits.saturating_add(amount);
        Ok(())
    }
}
