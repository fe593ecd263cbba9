//! Upstream provider adapters for ModelRelay.
//!
//! All adapters implement the `modelrelay_core::Adapter` trait. Each owns
//! its base URL, authentication scheme, transformers, retry policy, and a
//! dedicated HTTP client; adapters share no mutable state.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod retry;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use retry::{ErrorClass, RetryPolicy, classify_status};
