//! Candidate dispatch with classified retry and backoff.
//!
//! The dispatcher executes one logical request by iterating an ordered
//! candidate list. Failures are classified per attempt (see
//! [`FailureKind`]) and drive one of three moves:
//!
//! - **quota**: wait a randomized, widening backoff, then abandon the
//!   candidate — capacity exhaustion on one model says nothing about the
//!   next one;
//! - **transient server / transport**: wait a linearly growing backoff
//!   and retry the *same* candidate, up to the per-candidate try bound;
//! - **fatal**: abandon the candidate immediately.
//!
//! No metering happens here; the metering wrapper layers above.

pub mod policy;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{
    Candidate, CandidateList, Chunk, FailureKind, GenerationPayload, GenerationRequest,
    ProviderEndpoint, ProviderFailure, RequestOutcome,
};
pub use policy::RetryPolicy;

/// A finite, non-restartable stream of chunks from one streamed dispatch.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// Executes logical requests across an ordered candidate list.
pub struct Dispatcher {
    endpoint: Arc<dyn ProviderEndpoint>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher over the given endpoint.
    pub fn new(endpoint: Arc<dyn ProviderEndpoint>, policy: RetryPolicy) -> Self {
        Self { endpoint, policy }
    }

    /// The configured retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute one buffered request.
    ///
    /// Iterates candidates in list order with classified backoff. Returns
    /// `FatalFailure` naming the last observed failure once every
    /// candidate is exhausted, or when cancelled.
    pub async fn execute(
        &self,
        candidates: &CandidateList,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> RequestOutcome<GenerationPayload> {
        let mut last_failure: Option<ProviderFailure> = None;
        let mut quota_occurrences: u32 = 0;

        'candidates: for (index, candidate) in candidates.iter().enumerate() {
            let last_candidate = index + 1 == candidates.len();
            for attempt in 1..=self.policy.tries_per_candidate {
                if cancel.is_cancelled() {
                    return RequestOutcome::FatalFailure(ProviderFailure::fatal(
                        "dispatch cancelled",
                    ));
                }

                debug!(candidate = candidate.id(), attempt, "dispatch attempt");
                match self.endpoint.generate(candidate, request).await {
                    Ok(payload) => {
                        info!(candidate = candidate.id(), attempt, "dispatch succeeded");
                        return RequestOutcome::Success(payload);
                    }
                    Err(failure) => {
                        warn!(
                            candidate = candidate.id(),
                            attempt,
                            kind = ?failure.kind,
                            error = failure.message.as_str(),
                            "dispatch attempt failed"
                        );
                        let kind = failure.kind;
                        last_failure = Some(failure);

                        match kind {
                            FailureKind::QuotaExceeded => {
                                quota_occurrences += 1;
                                // With no candidate left to try, there is
                                // nothing to wait for.
                                if last_candidate {
                                    break 'candidates;
                                }
                                let wait = self.policy.quota_backoff(quota_occurrences);
                                if !sleep_cancellable(wait, cancel).await {
                                    return RequestOutcome::FatalFailure(
                                        ProviderFailure::fatal("dispatch cancelled"),
                                    );
                                }
                                continue 'candidates;
                            }
                            FailureKind::TransientServer | FailureKind::Transport => {
                                if attempt < self.policy.tries_per_candidate {
                                    let wait = self.policy.transient_backoff(attempt);
                                    if !sleep_cancellable(wait, cancel).await {
                                        return RequestOutcome::FatalFailure(
                                            ProviderFailure::fatal("dispatch cancelled"),
                                        );
                                    }
                                }
                                // Fall through to the next attempt, or the
                                // next candidate once the bound is hit.
                            }
                            FailureKind::Fatal => continue 'candidates,
                        }
                    }
                }
            }
        }

        let detail = last_failure
            .map(|f| f.to_string())
            .unwrap_or_else(|| "no candidates configured".to_owned());
        RequestOutcome::FatalFailure(ProviderFailure::fatal(format!(
            "all candidates exhausted: {detail}"
        )))
    }

    /// Execute one streamed request.
    ///
    /// A try for a candidate is opening the stream and forwarding chunks.
    /// Opening failures follow the buffered retry rules; any failure
    /// while a stream is open advances to the next candidate without
    /// retracting chunks already yielded. If no candidate ever yields a
    /// chunk, a single terminal fallback chunk is yielded so incremental
    /// renderers always see something.
    pub fn stream(
        &self,
        candidates: &CandidateList,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> ChunkStream {
        let endpoint = Arc::clone(&self.endpoint);
        let policy = self.policy.clone();
        let candidates = candidates.clone();
        let request = request.clone();
        let cancel = cancel.clone();

        Box::pin(stream! {
            let mut yielded_any = false;
            let mut quota_occurrences: u32 = 0;

            'candidates: for (index, candidate) in candidates.iter().enumerate() {
                if cancel.is_cancelled() {
                    return;
                }

                let last_candidate = index + 1 == candidates.len();
                let mut open = match open_with_retries(
                    endpoint.as_ref(),
                    &policy,
                    candidate,
                    &request,
                    &cancel,
                    &mut quota_occurrences,
                    last_candidate,
                )
                .await
                {
                    Some(stream) => stream,
                    None => continue 'candidates,
                };

                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = open.next() => item,
                    };
                    match item {
                        Some(Ok(chunk)) => {
                            yielded_any = true;
                            yield chunk;
                        }
                        Some(Err(failure)) => {
                            // Mid-stream failures are never resumed on the
                            // same candidate.
                            warn!(
                                candidate = candidate.id(),
                                kind = ?failure.kind,
                                error = failure.message.as_str(),
                                "stream failed mid-flight, advancing candidate"
                            );
                            continue 'candidates;
                        }
                        None => {
                            debug!(candidate = candidate.id(), "stream complete");
                            return;
                        }
                    }
                }
            }

            if !yielded_any && !cancel.is_cancelled() {
                warn!("all candidates exhausted before first chunk, yielding fallback");
                yield Chunk::fallback(policy.fallback_message.clone());
            }
        })
    }
}

/// Open a streaming channel for one candidate, applying the buffered
/// retry rules to the open itself. Returns `None` when the candidate
/// should be abandoned (or the dispatch was cancelled).
async fn open_with_retries(
    endpoint: &dyn ProviderEndpoint,
    policy: &RetryPolicy,
    candidate: &Candidate,
    request: &GenerationRequest,
    cancel: &CancellationToken,
    quota_occurrences: &mut u32,
    last_candidate: bool,
) -> Option<crate::provider::ChunkResultStream> {
    for attempt in 1..=policy.tries_per_candidate {
        if cancel.is_cancelled() {
            return None;
        }
        match endpoint.open_stream(candidate, request).await {
            Ok(stream) => return Some(stream),
            Err(failure) => {
                warn!(
                    candidate = candidate.id(),
                    attempt,
                    kind = ?failure.kind,
                    error = failure.message.as_str(),
                    "stream open failed"
                );
                match failure.kind {
                    FailureKind::QuotaExceeded => {
                        *quota_occurrences += 1;
                        if !last_candidate {
                            let wait = policy.quota_backoff(*quota_occurrences);
                            let _ = sleep_cancellable(wait, cancel).await;
                        }
                        return None;
                    }
                    FailureKind::TransientServer | FailureKind::Transport => {
                        if attempt < policy.tries_per_candidate
                            && !sleep_cancellable(policy.transient_backoff(attempt), cancel).await
                        {
                            return None;
                        }
                    }
                    FailureKind::Fatal => return None,
                }
            }
        }
    }
    None
}

/// Sleep that unblocks promptly on cancellation. Returns `false` when the
/// wait was cancelled.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted endpoint: each candidate has a queue of canned results.
    struct ScriptedEndpoint {
        script: Mutex<std::collections::HashMap<String, Vec<Result<String, ProviderFailure>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedEndpoint {
        fn new() -> Self {
            Self {
                script: Mutex::new(std::collections::HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn on(self, candidate: &str, results: Vec<Result<String, ProviderFailure>>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(candidate.to_owned(), results);
            self
        }

        fn calls_for(&self, candidate: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == candidate)
                .count()
        }
    }

    #[async_trait]
    impl ProviderEndpoint for ScriptedEndpoint {
        async fn generate(
            &self,
            candidate: &Candidate,
            _request: &GenerationRequest,
        ) -> Result<GenerationPayload, ProviderFailure> {
            self.calls.lock().unwrap().push(candidate.id().to_owned());
            let mut script = self.script.lock().unwrap();
            let queue = script
                .get_mut(candidate.id())
                .ok_or_else(|| ProviderFailure::fatal("unscripted candidate"))?;
            if queue.is_empty() {
                return Err(ProviderFailure::fatal("script exhausted"));
            }
            queue.remove(0).map(GenerationPayload::Text)
        }

        async fn open_stream(
            &self,
            candidate: &Candidate,
            request: &GenerationRequest,
        ) -> Result<crate::provider::ChunkResultStream, ProviderFailure> {
            // Streamed tries reuse the buffered script: a success becomes a
            // one-chunk stream.
            let text = self.generate(candidate, request).await?;
            let chunk = match text {
                GenerationPayload::Text(t) => Chunk::text(t),
                GenerationPayload::Audio(_) => return Err(ProviderFailure::fatal("not text")),
            };
            Ok(Box::pin(futures_util::stream::iter(vec![Ok(chunk)])))
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

    fn request() -> GenerationRequest {
        GenerationRequest::text(vec![crate::provider::Message::user("hi")])
    }

    #[tokio::test]
    async fn success_on_first_candidate() {
        let endpoint = Arc::new(ScriptedEndpoint::new().on("m1", vec![Ok("done".into())]));
        let dispatcher = Dispatcher::new(endpoint.clone(), fast_policy());
        let outcome = dispatcher
            .execute(
                &CandidateList::from_ids(["m1"]),
                &request(),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(endpoint.calls_for("m1"), 1);
    }

    #[tokio::test]
    async fn quota_abandons_candidate_after_one_try() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new()
                .on("m1", vec![Err(ProviderFailure::quota("429"))])
                .on("m2", vec![Ok("ok".into())]),
        );
        let dispatcher = Dispatcher::new(endpoint.clone(), fast_policy());
        let outcome = dispatcher
            .execute(
                &CandidateList::from_ids(["m1", "m2"]),
                &request(),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(endpoint.calls_for("m1"), 1);
        assert_eq!(endpoint.calls_for("m2"), 1);
    }

    #[tokio::test]
    async fn transient_retries_same_candidate_up_to_bound() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new()
                .on(
                    "m1",
                    vec![
                        Err(ProviderFailure::transient("500")),
                        Err(ProviderFailure::transient("500")),
                        Err(ProviderFailure::transient("500")),
                    ],
                )
                .on("m2", vec![Ok("ok".into())]),
        );
        let dispatcher = Dispatcher::new(endpoint.clone(), fast_policy());
        let outcome = dispatcher
            .execute(
                &CandidateList::from_ids(["m1", "m2"]),
                &request(),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(endpoint.calls_for("m1"), 3);
    }

    #[tokio::test]
    async fn fatal_advances_immediately() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new()
                .on("m1", vec![Err(ProviderFailure::fatal("bad input"))])
                .on("m2", vec![Ok("ok".into())]),
        );
        let dispatcher = Dispatcher::new(endpoint.clone(), fast_policy());
        let outcome = dispatcher
            .execute(
                &CandidateList::from_ids(["m1", "m2"]),
                &request(),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(endpoint.calls_for("m1"), 1);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_failure() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new().on("m1", vec![Err(ProviderFailure::fatal("schema"))]),
        );
        let dispatcher = Dispatcher::new(endpoint, fast_policy());
        let outcome = dispatcher
            .execute(
                &CandidateList::from_ids(["m1"]),
                &request(),
                &CancellationToken::new(),
            )
            .await;
        match outcome {
            RequestOutcome::FatalFailure(f) => {
                assert!(f.message.contains("all candidates exhausted"));
                assert!(f.message.contains("schema"));
            }
            other => panic!("expected fatal failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quota_on_the_last_candidate_skips_the_backoff() {
        let endpoint =
            Arc::new(ScriptedEndpoint::new().on("m1", vec![Err(ProviderFailure::quota("429"))]));
        let mut policy = fast_policy();
        policy.quota_window_min = Duration::from_secs(60);
        policy.quota_window_max = Duration::from_secs(61);
        let dispatcher = Dispatcher::new(endpoint, policy);
        let started = tokio::time::Instant::now();
        let outcome = dispatcher
            .execute(
                &CandidateList::from_ids(["m1"]),
                &request(),
                &CancellationToken::new(),
            )
            .await;
        assert!(!outcome.is_success());
        // Exhaustion is reported immediately, not after a pointless wait.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_before_a_remaining_candidate_still_backs_off() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new()
                .on("m1", vec![Err(ProviderFailure::quota("429"))])
                .on("m2", vec![Ok("ok".into())]),
        );
        let mut policy = fast_policy();
        policy.quota_window_min = Duration::from_secs(60);
        policy.quota_window_max = Duration::from_secs(61);
        let dispatcher = Dispatcher::new(endpoint, policy);
        let started = tokio::time::Instant::now();
        let outcome = dispatcher
            .execute(
                &CandidateList::from_ids(["m1", "m2"]),
                &request(),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn cancellation_stops_further_attempts() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new().on("m1", vec![Err(ProviderFailure::transient("500")); 3]),
        );
        let dispatcher = Dispatcher::new(endpoint.clone(), fast_policy());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = dispatcher
            .execute(&CandidateList::from_ids(["m1"]), &request(), &cancel)
            .await;
        assert!(!outcome.is_success());
        assert_eq!(endpoint.calls_for("m1"), 0);
    }

    #[tokio::test]
    async fn streamed_exhaustion_yields_single_fallback() {
        let endpoint = Arc::new(
            ScriptedEndpoint::new()
                .on("m1", vec![Err(ProviderFailure::fatal("down"))])
                .on("m2", vec![Err(ProviderFailure::fatal("down"))]),
        );
        let dispatcher = Dispatcher::new(endpoint, fast_policy());
        let chunks: Vec<Chunk> = dispatcher
            .stream(
                &CandidateList::from_ids(["m1", "m2"]),
                &request(),
                &CancellationToken::new(),
            )
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].fallback);
        assert_eq!(chunks[0].text, "unavailable");
    }

    #[tokio::test]
    async fn streamed_success_yields_content() {
        let endpoint = Arc::new(ScriptedEndpoint::new().on("m1", vec![Ok("hola".into())]));
        let dispatcher = Dispatcher::new(endpoint, fast_policy());
        let chunks: Vec<Chunk> = dispatcher
            .stream(
                &CandidateList::from_ids(["m1"]),
                &request(),
                &CancellationToken::new(),
            )
            .collect()
            .await;
        assert_eq!(chunks, vec![Chunk::text("hola")]);
    }
}
