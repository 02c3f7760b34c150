//! Charge-commitment rules: gate before network, charge once on
//! observed success, fail closed on ledger trouble.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use verba::dispatch::{Dispatcher, RetryPolicy};
use verba::ledger::{
    AuthoritativeBalance, Credits, InMemoryLedger, LedgerError, LedgerStore, UserId,
};
use verba::metering::{MeterError, MeteredClient, MeteredOperation, OperationKind, UserAccount};
use verba::provider::{
    Candidate, CandidateList, Chunk, ChunkResultStream, GenerationPayload, GenerationRequest,
    Message, ProviderEndpoint, ProviderFailure,
};

/// Counts calls; fails a configurable number of times before succeeding.
struct FlakyEndpoint {
    calls: AtomicUsize,
    failures_before_success: usize,
}

impl FlakyEndpoint {
    fn new(failures_before_success: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures_before_success,
        }
    }

    fn attempt(&self) -> Result<String, ProviderFailure> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures_before_success {
            Err(ProviderFailure::transient("503"))
        } else {
            Ok("respuesta".to_owned())
        }
    }
}

#[async_trait]
impl ProviderEndpoint for FlakyEndpoint {
    async fn generate(
        &self,
        _candidate: &Candidate,
        _request: &GenerationRequest,
    ) -> Result<GenerationPayload, ProviderFailure> {
        self.attempt().map(GenerationPayload::Text)
    }

    async fn open_stream(
        &self,
        _candidate: &Candidate,
        _request: &GenerationRequest,
    ) -> Result<ChunkResultStream, ProviderFailure> {
        let text = self.attempt()?;
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(Chunk::text(
            text,
        ))])))
    }
}

/// Ledger whose deducts fail with an unknown outcome.
struct UnreachableDeductLedger {
    inner: InMemoryLedger,
}

#[async_trait]
impl LedgerStore for UnreachableDeductLedger {
    async fn create_account(&self, user: &UserId, welcome: Credits) -> Result<(), LedgerError> {
        self.inner.create_account(user, welcome).await
    }

    async fn balance(&self, user: &UserId) -> Result<AuthoritativeBalance, LedgerError> {
        self.inner.balance(user).await
    }

    async fn try_deduct(&self, _user: &UserId, _amount: Credits) -> Result<bool, LedgerError> {
        Err(LedgerError::Unavailable("ledger offline".to_owned()))
    }

    async fn credit(&self, user: &UserId, amount: Credits) -> Result<(), LedgerError> {
        self.inner.credit(user, amount).await
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        tries_per_candidate: 3,
        transient_step: Duration::from_millis(1),
        quota_window_min: Duration::from_millis(1),
        quota_window_max: Duration::from_millis(2),
        fallback_message: "unavailable".to_owned(),
    }
}

fn client_over(
    endpoint: Arc<dyn ProviderEndpoint>,
    ledger: Arc<dyn LedgerStore>,
) -> MeteredClient {
    MeteredClient::new(ledger, Arc::new(Dispatcher::new(endpoint, fast_policy())))
}

fn lesson(cost: Credits) -> MeteredOperation {
    MeteredOperation {
        kind: OperationKind::LessonTurn,
        cost,
    }
}

fn request() -> GenerationRequest {
    GenerationRequest::text(vec![Message::user("hola")])
}

#[tokio::test]
async fn transient_failures_then_success_debits_exactly_once() {
    let endpoint = Arc::new(FlakyEndpoint::new(2));
    let user = UserId::new("leo");
    let ledger = Arc::new(InMemoryLedger::with_account(&user, 10).await);
    let client = client_over(endpoint.clone(), ledger.clone());

    let payload = client
        .metered_call(
            &UserAccount::metered("leo"),
            lesson(3),
            &CandidateList::from_ids(["m1"]),
            &request(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(payload.as_text(), Some("respuesta"));
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.balance(&user).await.unwrap().credits(), 7);
}

#[tokio::test]
async fn insufficient_balance_refuses_before_any_network_call() {
    let endpoint = Arc::new(FlakyEndpoint::new(0));
    let user = UserId::new("mia");
    let ledger = Arc::new(InMemoryLedger::with_account(&user, 3).await);
    let client = client_over(endpoint.clone(), ledger.clone());

    let result = client
        .metered_call(
            &UserAccount::metered("mia"),
            lesson(5),
            &CandidateList::from_ids(["m1"]),
            &request(),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(MeterError::InsufficientFunds)));
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    // No state mutation either.
    assert_eq!(ledger.balance(&user).await.unwrap().credits(), 3);
}

#[tokio::test]
async fn provider_exhaustion_costs_nothing() {
    // Never succeeds: 3 transient failures exhaust the only candidate.
    let endpoint = Arc::new(FlakyEndpoint::new(usize::MAX));
    let user = UserId::new("sol");
    let ledger = Arc::new(InMemoryLedger::with_account(&user, 10).await);
    let client = client_over(endpoint, ledger.clone());

    let result = client
        .metered_call(
            &UserAccount::metered("sol"),
            lesson(2),
            &CandidateList::from_ids(["m1"]),
            &request(),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(MeterError::ProviderUnavailable(_))));
    assert_eq!(ledger.balance(&user).await.unwrap().credits(), 10);
}

#[tokio::test]
async fn fallback_only_stream_is_never_billed() {
    let endpoint = Arc::new(FlakyEndpoint::new(usize::MAX));
    let user = UserId::new("eva");
    let ledger = Arc::new(InMemoryLedger::with_account(&user, 10).await);
    let client = client_over(endpoint, ledger.clone());

    let stream = client
        .metered_stream(
            &UserAccount::metered("eva"),
            lesson(2),
            &CandidateList::from_ids(["m1"]),
            &request(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let chunks: Vec<Chunk> = stream.collect().await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].fallback);
    assert_eq!(ledger.balance(&user).await.unwrap().credits(), 10);
}

#[tokio::test]
async fn unknown_deduct_outcome_fails_closed() {
    let endpoint = Arc::new(FlakyEndpoint::new(0));
    let user = UserId::new("ivo");
    let inner = InMemoryLedger::with_account(&user, 10).await;
    let ledger = Arc::new(UnreachableDeductLedger { inner });
    let client = client_over(endpoint, ledger);

    let result = client
        .metered_call(
            &UserAccount::metered("ivo"),
            lesson(2),
            &CandidateList::from_ids(["m1"]),
            &request(),
            &CancellationToken::new(),
        )
        .await;

    // The payload existed, but the charge outcome is unknown: the
    // operation's benefit is not granted.
    assert!(matches!(result, Err(MeterError::Ledger(_))));
}

#[tokio::test]
async fn concurrent_metered_calls_never_overdraw() {
    let endpoint = Arc::new(FlakyEndpoint::new(0));
    let user = UserId::new("pia");
    // 5 credits, 4 concurrent calls of cost 2: at most 2 can clear.
    let ledger = Arc::new(InMemoryLedger::with_account(&user, 5).await);
    let client = Arc::new(client_over(endpoint, ledger.clone()));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client
                .metered_call(
                    &UserAccount::metered("pia"),
                    lesson(2),
                    &CandidateList::from_ids(["m1"]),
                    &request(),
                    &CancellationToken::new(),
                )
                .await
                .is_ok()
        }));
    }
    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap() {
            successes += 1;
        }
    }

    assert!(successes <= 2);
    let remaining = ledger.balance(&user).await.unwrap().credits();
    assert_eq!(remaining, 5 - 2 * successes);
}

#[tokio::test]
async fn explicit_refund_is_recorded_and_idempotent() {
    let endpoint = Arc::new(FlakyEndpoint::new(0));
    let user = UserId::new("kai");
    let ledger = Arc::new(InMemoryLedger::with_account(&user, 10).await);
    let client = client_over(endpoint, ledger.clone());
    let account = UserAccount::metered("kai");
    let request_id = Uuid::new_v4();

    assert!(client.refund_once(&account, request_id, 4).await.unwrap());
    assert!(!client.refund_once(&account, request_id, 4).await.unwrap());
    assert_eq!(ledger.balance(&user).await.unwrap().credits(), 14);
}
