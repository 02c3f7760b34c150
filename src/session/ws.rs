//! Websocket-backed voice channel.
//!
//! Frames are JSON text messages. Outbound: `{"type":"audio", ...}`
//! carrying base64 PCM. Inbound mirrors that plus turn-boundary and
//! error signals.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::channel::{InboundEvent, OutboundAudioFrame, VoiceChannel, VoiceConnector};
use crate::provider::{Candidate, ProviderFailure};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A handshake that takes longer than this counts as a transport failure
/// so the session moves on instead of sitting in `Connecting`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens websocket voice channels against one provider host.
pub struct WsVoiceConnector {
    base_url: String,
    api_key: String,
}

impl WsVoiceConnector {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint_url(&self, candidate: &Candidate) -> Result<Url, ProviderFailure> {
        let raw = format!(
            "{}/v1/voice?model={}&key={}",
            self.base_url.trim_end_matches('/'),
            candidate.id(),
            self.api_key
        );
        Url::parse(&raw).map_err(|e| ProviderFailure::fatal(format!("bad voice url: {e}")))
    }
}

#[async_trait]
impl VoiceConnector for WsVoiceConnector {
    async fn connect(
        &self,
        candidate: &Candidate,
    ) -> Result<Box<dyn VoiceChannel>, ProviderFailure> {
        let url = self.endpoint_url(candidate)?;
        debug!(candidate = %candidate.id(), "opening voice channel");
        let (stream, response) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ProviderFailure::transport("voice handshake timed out"))?
        .map_err(classify_ws_error)?;
        debug!(status = %response.status(), "voice channel open");
        let (write, read) = stream.split();
        Ok(Box::new(WsVoiceChannel { write, read }))
    }
}

/// Map a websocket handshake error onto the request-path taxonomy so the
/// session can reuse the candidate-advance rules.
fn classify_ws_error(err: tokio_tungstenite::tungstenite::Error) -> ProviderFailure {
    use tokio_tungstenite::tungstenite::Error;
    match &err {
        Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 429 || status.as_u16() == 403 {
                ProviderFailure::quota(format!("voice handshake rejected: {status}"))
            } else if status.is_server_error() {
                ProviderFailure::transient(format!("voice handshake failed: {status}"))
            } else {
                ProviderFailure::fatal(format!("voice handshake failed: {status}"))
            }
        }
        Error::Io(_) | Error::ConnectionClosed | Error::AlreadyClosed => {
            ProviderFailure::transport(format!("voice connect failed: {err}"))
        }
        _ => ProviderFailure::fatal(format!("voice connect failed: {err}")),
    }
}

/// One open websocket voice channel.
pub struct WsVoiceChannel {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl VoiceChannel for WsVoiceChannel {
    async fn send_audio(&mut self, frame: OutboundAudioFrame) -> Result<(), ProviderFailure> {
        let payload = json!({
            "type": "audio",
            "audio": frame.pcm_b64,
            "sample_rate": frame.sample_rate,
        });
        self.write
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| ProviderFailure::transport(format!("voice send failed: {e}")))
    }

    async fn next_event(&mut self) -> Option<InboundEvent> {
        loop {
            let message = match self.read.next().await {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Close(_))) | None => return Some(InboundEvent::Closed),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(InboundEvent::Error(format!("voice read: {e}"))),
            };
            match parse_inbound(&message) {
                Some(event) => return Some(event),
                None => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.send(Message::Close(None)).await {
            warn!("voice channel close failed (ignored): {e}");
        }
    }
}

fn parse_inbound(raw: &str) -> Option<InboundEvent> {
    let payload: serde_json::Value = serde_json::from_str(raw).ok()?;
    let kind = payload.get("type").and_then(serde_json::Value::as_str)?;
    match kind {
        "audio" => {
            let pcm_b64 = payload
                .get("audio")
                .and_then(serde_json::Value::as_str)?
                .to_owned();
            let sample_rate = payload
                .get("sample_rate")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(24_000) as u32;
            Some(InboundEvent::Audio {
                pcm_b64,
                sample_rate,
            })
        }
        "turn_complete" => Some(InboundEvent::TurnComplete),
        "interrupted" => Some(InboundEvent::Interrupted),
        "error" => {
            let message = payload
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown channel error");
            Some(InboundEvent::Error(message.to_owned()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn parses_audio_frame() {
        let raw = r#"{"type":"audio","audio":"AAAA","sample_rate":16000}"#;
        match parse_inbound(raw) {
            Some(InboundEvent::Audio {
                pcm_b64,
                sample_rate,
            }) => {
                assert_eq!(pcm_b64, "AAAA");
                assert_eq!(sample_rate, 16_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_turn_boundary_and_error() {
        assert!(matches!(
            parse_inbound(r#"{"type":"turn_complete"}"#),
            Some(InboundEvent::TurnComplete)
        ));
        match parse_inbound(r#"{"type":"error","message":"overloaded"}"#) {
            Some(InboundEvent::Error(msg)) => assert_eq!(msg, "overloaded"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_frames() {
        assert!(parse_inbound(r#"{"type":"metadata","x":1}"#).is_none());
        assert!(parse_inbound("not json").is_none());
    }

    #[test]
    fn endpoint_url_includes_candidate() {
        let connector = WsVoiceConnector::new("wss://api.example.com/", "k-123");
        let url = connector
            .endpoint_url(&Candidate::new("gem-live-1"))
            .unwrap();
        assert!(url.as_str().contains("model=gem-live-1"));
    }
}
