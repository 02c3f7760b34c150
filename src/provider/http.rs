//! HTTP provider endpoint with SSE streaming.
//!
//! Speaks a small JSON protocol against a provider gateway: one POST per
//! buffered request, SSE-framed `{"delta": "..."}` events for streamed
//! requests, and raw bytes for speech synthesis. The exact upstream wire
//! format lives behind the gateway; this adapter only needs the
//! classification rules to hold.

use async_stream::stream;
use futures_util::StreamExt;
use serde_json::json;
use tracing::debug;

use super::endpoint::{ChunkResultStream, ProviderEndpoint};
use super::message::{Candidate, Chunk, GenerationPayload, GenerationRequest, OutputMode};
use super::outcome::ProviderFailure;
use super::sse::SseReader;
use async_trait::async_trait;

/// Configuration for the HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpEndpointConfig {
    /// Gateway base URL, no trailing slash.
    pub base_url: String,
    /// Bearer token, if the gateway requires one.
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl HttpEndpointConfig {
    /// Create a config for the given base URL with defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_secs: 60,
        }
    }

    /// Attach a bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// reqwest-backed [`ProviderEndpoint`].
pub struct HttpProviderEndpoint {
    config: HttpEndpointConfig,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpProviderEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderEndpoint")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl HttpProviderEndpoint {
    /// Create an endpoint from config.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`ProviderFailure`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: HttpEndpointConfig) -> Result<Self, ProviderFailure> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderFailure::fatal(format!("cannot build http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn request_body(candidate: &Candidate, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        json!({
            "model": candidate.id(),
            "messages": request.messages,
            "options": request.options,
            "output": request.output,
            "stream": stream,
        })
    }

    fn build_post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/generate", self.config.base_url);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn send_checked(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderFailure> {
        let response = self
            .build_post(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body_text));
        }
        Ok(response)
    }
}

/// Map an HTTP error status onto the failure taxonomy.
///
/// 429 and 403 mean this candidate is out of capacity; 5xx is a server
/// hiccup worth retrying on the same candidate; anything else is fatal.
pub fn classify_http_status(status: reqwest::StatusCode, body: &str) -> ProviderFailure {
    let message = extract_error_message(body);
    match status.as_u16() {
        429 | 403 => ProviderFailure::quota(format!("provider over limit ({status}): {message}")),
        500..=599 => {
            ProviderFailure::transient(format!("provider server error ({status}): {message}"))
        }
        _ => ProviderFailure::fatal(format!("provider rejected request ({status}): {message}")),
    }
}

/// Map a reqwest transport error onto the failure taxonomy.
pub fn classify_reqwest_error(error: reqwest::Error) -> ProviderFailure {
    if error.is_timeout() || error.is_connect() {
        ProviderFailure::transport(format!("request failed: {error}"))
    } else if let Some(status) = error.status() {
        classify_http_status(status, "")
    } else {
        ProviderFailure::transport(format!("request failed: {error}"))
    }
}

/// Pull a `{"error": {"message": ...}}` string out of an error body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

#[async_trait]
impl ProviderEndpoint for HttpProviderEndpoint {
    async fn generate(
        &self,
        candidate: &Candidate,
        request: &GenerationRequest,
    ) -> Result<GenerationPayload, ProviderFailure> {
        let body = Self::request_body(candidate, request, false);
        let response = self.send_checked(&body).await?;

        match request.output {
            OutputMode::Audio => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(classify_reqwest_error)?;
                if bytes.is_empty() {
                    return Err(ProviderFailure::fatal("empty audio payload"));
                }
                Ok(GenerationPayload::Audio(bytes.to_vec()))
            }
            OutputMode::Text => {
                let value: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderFailure::fatal(format!("undecodable response: {e}")))?;
                let text = value
                    .get("text")
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| ProviderFailure::fatal("response missing text field"))?;
                Ok(GenerationPayload::Text(text.to_owned()))
            }
        }
    }

    async fn open_stream(
        &self,
        candidate: &Candidate,
        request: &GenerationRequest,
    ) -> Result<ChunkResultStream, ProviderFailure> {
        let body = Self::request_body(candidate, request, true);
        let response = self.send_checked(&body).await?;
        debug!(candidate = candidate.id(), "stream channel open");

        let mut byte_stream = response.bytes_stream();
        let chunk_stream = stream! {
            let mut reader = SseReader::new();
            loop {
                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        for event in reader.feed(&bytes) {
                            if event.is_done() {
                                return;
                            }
                            match parse_delta(&event.0) {
                                Ok(Some(chunk)) => yield Ok(chunk),
                                Ok(None) => {}
                                Err(failure) => {
                                    yield Err(failure);
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(ProviderFailure::transport(format!(
                            "stream read failed: {e}"
                        )));
                        return;
                    }
                    None => {
                        if let Some(event) = reader.finish() {
                            if !event.is_done() {
                                if let Ok(Some(chunk)) = parse_delta(&event.0) {
                                    yield Ok(chunk);
                                }
                            }
                        }
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(chunk_stream))
    }
}

/// Parse one SSE data payload into a chunk.
///
/// Events carry either `{"delta": "..."}` or `{"error": ...}`.
fn parse_delta(data: &str) -> Result<Option<Chunk>, ProviderFailure> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ProviderFailure::fatal(format!("undecodable stream event: {e}")))?;
    if value.get("error").is_some() {
        return Err(ProviderFailure::transient(extract_error_message(data)));
    }
    Ok(value
        .get("delta")
        .and_then(|d| d.as_str())
        .filter(|d| !d.is_empty())
        .map(Chunk::text))
}
