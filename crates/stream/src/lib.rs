//! Streaming primitives for ModelRelay.
//!
//! Two building blocks live here:
//! - [`pipe::StreamPipe`] — a bounded single-producer / single-consumer
//!   queue bridging an upstream body reader to the downstream SSE writer,
//!   with backpressure, cancellation, and at-most-once close.
//! - [`sse`] — parsing of inbound `text/event-stream` bodies and framing
//!   of outbound SSE events.

pub mod pipe;
pub mod sse;

pub use pipe::{CloseOutcome, PipeError, StreamPipe};
pub use sse::{SseEvent, SseParser};
