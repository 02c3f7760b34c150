//! Credit metering around candidate dispatch.
//!
//! [`MeteredClient`] composes the ledger and the dispatcher: it
//! re-fetches the authoritative balance for the gating decision, runs
//! the dispatch, and commits the charge only once forward progress has
//! been observed — a successful payload for buffered calls, the first
//! real chunk for streamed calls. Refunds never happen automatically on
//! provider failure; they are an explicit, idempotent rollback reserved
//! for failures internal to orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::stream;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::dispatch::{ChunkStream, Dispatcher};
use crate::ledger::{Credits, LedgerError, LedgerStore, UserId};
use crate::provider::{CandidateList, GenerationPayload, GenerationRequest, RequestOutcome};
use tracing::{info, warn};

/// What a metered operation pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// One lesson turn (buffered or streamed text generation).
    LessonTurn,
    /// One speech synthesis request.
    SpeechSynthesis,
    /// One minute of live voice.
    VoiceMinute,
}

/// A declared unit of work and its price. Configuration-level data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeteredOperation {
    /// The unit of work.
    pub kind: OperationKind,
    /// Price in credits.
    pub cost: Credits,
}

impl MeteredOperation {
    /// A lesson-turn operation priced from config.
    pub fn lesson_turn(billing: &BillingConfig) -> Self {
        Self {
            kind: OperationKind::LessonTurn,
            cost: billing.lesson_turn_cost,
        }
    }

    /// A speech-synthesis operation priced from config.
    pub fn synthesis(billing: &BillingConfig) -> Self {
        Self {
            kind: OperationKind::SpeechSynthesis,
            cost: billing.synthesis_cost,
        }
    }

    /// A voice-minute operation priced from config.
    pub fn voice_minute(billing: &BillingConfig) -> Self {
        Self {
            kind: OperationKind::VoiceMinute,
            cost: billing.voice_minute_cost,
        }
    }
}

/// The account a metered call runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    /// Ledger key.
    pub id: UserId,
    /// Unlimited-role accounts skip gating and are never charged.
    pub unlimited: bool,
}

impl UserAccount {
    /// A normal, metered account.
    pub fn metered(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            unlimited: false,
        }
    }

    /// An unlimited-role account.
    pub fn unlimited(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            unlimited: true,
        }
    }
}

/// The small normalized error surface UI collaborators switch on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MeterError {
    /// The balance does not cover the operation; nothing was attempted.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Every candidate failed.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The payload failed structural validation.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A ledger call failed; the operation fails closed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Composes balance gating, dispatch, and charge commitment.
pub struct MeteredClient {
    ledger: Arc<dyn LedgerStore>,
    dispatcher: Arc<Dispatcher>,
    refunded: Mutex<HashSet<Uuid>>,
}

impl std::fmt::Debug for MeteredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredClient").finish()
    }
}

impl MeteredClient {
    /// Create a metering wrapper over a ledger and dispatcher.
    pub fn new(ledger: Arc<dyn LedgerStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            ledger,
            dispatcher,
            refunded: Mutex::new(HashSet::new()),
        }
    }

    /// Gate on the authoritative balance. No network call happens when
    /// this fails.
    async fn gate(&self, account: &UserAccount, cost: Credits) -> Result<(), MeterError> {
        if account.unlimited {
            return Ok(());
        }
        let balance = self.ledger.balance(&account.id).await?;
        if !balance.covers(cost) {
            info!(
                user = %account.id,
                balance = balance.credits(),
                cost,
                "metered call refused: insufficient funds"
            );
            return Err(MeterError::InsufficientFunds);
        }
        Ok(())
    }

    /// Commit the charge after observed success. Fails closed: an
    /// unknown deduct outcome fails the whole operation.
    async fn charge(&self, account: &UserAccount, cost: Credits) -> Result<(), MeterError> {
        if account.unlimited || cost == 0 {
            return Ok(());
        }
        let deducted = self.ledger.try_deduct(&account.id, cost).await?;
        if !deducted {
            // The balance moved between gate and charge; the benefit is
            // not granted.
            warn!(user = %account.id, cost, "charge lost race with balance, failing closed");
            return Err(MeterError::InsufficientFunds);
        }
        Ok(())
    }

    /// Execute one buffered metered call.
    ///
    /// Charges `operation.cost` exactly once, only after the dispatcher
    /// reports success.
    pub async fn metered_call(
        &self,
        account: &UserAccount,
        operation: MeteredOperation,
        candidates: &CandidateList,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationPayload, MeterError> {
        self.gate(account, operation.cost).await?;

        match self.dispatcher.execute(candidates, request, cancel).await {
            RequestOutcome::Success(payload) => {
                self.charge(account, operation.cost).await?;
                Ok(payload)
            }
            RequestOutcome::RetryableFailure(f) | RequestOutcome::FatalFailure(f) => {
                Err(MeterError::ProviderUnavailable(f.message))
            }
        }
    }

    /// Execute one streamed metered call.
    ///
    /// The gate runs before any network activity. The returned stream
    /// charges exactly once, at the first non-empty, non-fallback chunk;
    /// a stream that never yields real content costs nothing. A failed
    /// charge ends the stream without delivering the gated chunk.
    pub async fn metered_stream(
        &self,
        account: &UserAccount,
        operation: MeteredOperation,
        candidates: &CandidateList,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, MeterError> {
        self.gate(account, operation.cost).await?;

        let mut inner = self.dispatcher.stream(candidates, request, cancel);
        let ledger = Arc::clone(&self.ledger);
        let account = account.clone();
        let cost = operation.cost;

        Ok(Box::pin(stream! {
            let mut charged = false;
            while let Some(chunk) = inner.next().await {
                if !charged && chunk.is_real_content() {
                    if account.unlimited || cost == 0 {
                        charged = true;
                    } else {
                        match ledger.try_deduct(&account.id, cost).await {
                            Ok(true) => charged = true,
                            Ok(false) => {
                                warn!(user = %account.id, "stream charge refused, ending stream");
                                return;
                            }
                            Err(e) => {
                                // Unknown charge outcome: fail closed.
                                warn!(user = %account.id, error = %e, "stream charge failed, ending stream");
                                return;
                            }
                        }
                    }
                }
                yield chunk;
            }
        }))
    }

    /// Execute a buffered call whose payload must be valid JSON.
    ///
    /// On structural failure after the charge was committed, performs the
    /// explicit idempotent rollback and surfaces [`MeterError::Malformed`].
    pub async fn metered_json_call(
        &self,
        account: &UserAccount,
        operation: MeteredOperation,
        candidates: &CandidateList,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, MeterError> {
        let request_id = Uuid::new_v4();
        let payload = self
            .metered_call(account, operation, candidates, request, cancel)
            .await?;

        let text = match payload.as_text() {
            Some(text) => text,
            None => {
                self.refund_once(account, request_id, operation.cost).await?;
                return Err(MeterError::Malformed("expected a text payload".to_owned()));
            }
        };
        match serde_json::from_str(text) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.refund_once(account, request_id, operation.cost).await?;
                Err(MeterError::Malformed(format!("payload is not valid JSON: {e}")))
            }
        }
    }

    /// Idempotently refund a previously committed charge.
    ///
    /// Records the request id; a second refund for the same id is a
    /// no-op. Returns `true` when credits were actually returned.
    pub async fn refund_once(
        &self,
        account: &UserAccount,
        request_id: Uuid,
        amount: Credits,
    ) -> Result<bool, MeterError> {
        if account.unlimited || amount == 0 {
            return Ok(false);
        }
        let mut refunded = self.refunded.lock().await;
        if !refunded.insert(request_id) {
            return Ok(false);
        }
        // Hold the log lock across the credit so a concurrent duplicate
        // cannot slip between insert and credit.
        self.ledger.credit(&account.id, amount).await?;
        info!(user = %account.id, %request_id, amount, "refund applied");
        Ok(true)
    }
}
