//! Provider endpoint trait.
//!
//! Defines the [`ProviderEndpoint`] trait that concrete provider
//! integrations satisfy. Endpoints accept a candidate identifier plus a
//! provider-neutral request and normalize their failures into the shared
//! [`ProviderFailure`] taxonomy, so the dispatcher never sees raw
//! transport errors.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use super::message::{Candidate, Chunk, GenerationPayload, GenerationRequest};
use super::outcome::ProviderFailure;

/// A boxed stream of text chunks from one open streaming channel.
///
/// Items are `Err` when the stream fails mid-flight; the dispatcher
/// treats that as non-resumable for the current candidate.
pub type ChunkResultStream =
    Pin<Box<dyn Stream<Item = Result<Chunk, ProviderFailure>> + Send>>;

/// Trait for inference provider endpoints.
#[async_trait]
pub trait ProviderEndpoint: Send + Sync {
    /// Execute one buffered request against the given candidate.
    async fn generate(
        &self,
        candidate: &Candidate,
        request: &GenerationRequest,
    ) -> Result<GenerationPayload, ProviderFailure>;

    /// Open a streaming channel against the given candidate.
    ///
    /// Returns `Err` when the channel cannot be opened; mid-stream
    /// failures surface as `Err` items on the returned stream.
    async fn open_stream(
        &self,
        candidate: &Candidate,
        request: &GenerationRequest,
    ) -> Result<ChunkResultStream, ProviderFailure>;
}
