//! Provider-neutral request and payload types.

use serde::{Deserialize, Serialize};

/// One selectable inference target in a priority-ordered list.
///
/// Opaque to the dispatcher: a model name or connection profile id.
/// Immutable at request time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub String);

impl Candidate {
    /// Create a candidate from a model identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The underlying identifier.
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered list of interchangeable inference targets.
///
/// Order is priority: the first candidate is tried first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateList(pub Vec<Candidate>);

impl CandidateList {
    /// Build a list from string identifiers, preserving order.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Candidate::new).collect())
    }

    /// Iterate candidates in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.0.iter()
    }

    /// Whether the list has no candidates.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System/instruction message.
    System,
    /// End-user message.
    User,
    /// Model-generated message.
    Assistant,
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generation tuning options forwarded to the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum output tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// What the provider should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Structured or free text.
    Text,
    /// Binary audio (speech synthesis).
    Audio,
}

/// One logical request against a provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Role-tagged message list.
    pub messages: Vec<Message>,
    /// Generation config.
    pub options: GenerationOptions,
    /// Requested output kind.
    pub output: OutputMode,
}

impl GenerationRequest {
    /// Build a text request from a message list.
    pub fn text(messages: Vec<Message>) -> Self {
        Self {
            messages,
            options: GenerationOptions::default(),
            output: OutputMode::Text,
        }
    }

    /// Build a speech-synthesis request for the given text.
    pub fn speech(text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(text)],
            options: GenerationOptions::default(),
            output: OutputMode::Audio,
        }
    }

    /// Set generation options.
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// The result payload from one successful buffered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationPayload {
    /// Generated text.
    Text(String),
    /// Synthesized audio bytes.
    Audio(Vec<u8>),
}

impl GenerationPayload {
    /// The text payload, if this is a text result.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Audio(_) => None,
        }
    }
}

/// One streamed text chunk.
///
/// A `fallback` chunk is the terminal unavailability message yielded when
/// every candidate failed before producing output; it is user-visible but
/// never billable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Text fragment.
    pub text: String,
    /// Whether this is the terminal unavailability fallback.
    pub fallback: bool,
}

impl Chunk {
    /// A normal content chunk.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fallback: false,
        }
    }

    /// The terminal fallback chunk.
    pub fn fallback(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fallback: true,
        }
    }

    /// Whether this chunk represents real generated content.
    ///
    /// Only real content counts as forward progress for metering.
    pub fn is_real_content(&self) -> bool {
        !self.fallback && !self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_list_preserves_order() {
        let list = CandidateList::from_ids(["m1", "m2", "m3"]);
        let ids: Vec<&str> = list.iter().map(Candidate::id).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn fallback_chunk_is_not_real_content() {
        assert!(Chunk::text("hola").is_real_content());
        assert!(!Chunk::text("").is_real_content());
        assert!(!Chunk::fallback("unavailable").is_real_content());
    }

    #[test]
    fn message_constructors_tag_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn speech_request_targets_audio_output() {
        let req = GenerationRequest::speech("bonjour");
        assert_eq!(req.output, OutputMode::Audio);
        assert_eq!(req.messages.len(), 1);
    }
}
