//! Core domain types and traits for ModelRelay.
//!
//! Everything the dispatch fabric shares lives here: the canonical wire
//! shapes, the [`provider::Adapter`] contract, the error taxonomy, and the
//! per-request context.

pub mod chat;
pub mod context;
pub mod error;
pub mod provider;

pub use chat::{ApiType, ChatCompletionRequest, ChatCompletionResponse, FinishReason, Usage};
pub use context::{ApiKeyName, ProjectId, RequestContext, RequestId, TraceId};
pub use error::{GatewayError, Result};
pub use provider::{
    Adapter, ChunkPipe, ProviderRequest, ProviderResult, ProviderStatus, RequestPayload,
    ResponsePayload, StreamChunk,
};
