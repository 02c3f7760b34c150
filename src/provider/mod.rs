//! Provider-facing types: candidates, requests, failure taxonomy, and
//! the endpoint trait concrete integrations implement.

pub mod endpoint;
pub mod http;
pub mod message;
pub mod outcome;
pub mod sse;

pub use endpoint::{ChunkResultStream, ProviderEndpoint};
pub use http::{HttpEndpointConfig, HttpProviderEndpoint};
pub use message::{
    Candidate, CandidateList, Chunk, GenerationOptions, GenerationPayload, GenerationRequest,
    Message, OutputMode, Role,
};
pub use outcome::{FailureKind, ProviderFailure, RequestOutcome};
