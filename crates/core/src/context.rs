//! Per-request context with type-keyed slots.
//!
//! The context carries a small fixed set of correlation values (request
//! id, trace id, api-key name, project id, principal) through the dispatch
//! path. Each slot is keyed by its Rust type, so two slots can never
//! collide even if their underlying representations are identical —
//! reading an absent slot simply yields `None`.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use uuid::Uuid;

/// The stable identifier of one gateway request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The trace identifier, inherited from the caller when provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The logical name of the API key that authenticated the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyName(pub String);

/// The project scope the request runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectId(pub String);

/// Type-keyed slot map for one request. Never mutated after the auth
/// layer finishes populating it.
#[derive(Debug, Default)]
pub struct RequestContext {
    slots: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with request-id and trace-id already resolved:
    /// both inherited from the caller when present, freshly generated
    /// otherwise.
    pub fn with_correlation(request_id: Option<String>, trace_id: Option<String>) -> Self {
        let mut ctx = Self::new();
        ctx.insert(request_id.map(RequestId).unwrap_or_else(RequestId::generate));
        ctx.insert(trace_id.map(TraceId).unwrap_or_else(TraceId::generate));
        ctx
    }

    /// Store a slot value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.slots.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Read a slot by type; absent slots yield `None`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// The request id, or an empty string when unset (readers of absent
    /// slots observe the zero value).
    pub fn request_id(&self) -> String {
        self.get::<RequestId>().map(|r| r.0.clone()).unwrap_or_default()
    }

    pub fn trace_id(&self) -> String {
        self.get::<TraceId>().map(|t| t.0.clone()).unwrap_or_default()
    }

    pub fn api_key_name(&self) -> String {
        self.get::<ApiKeyName>().map(|k| k.0.clone()).unwrap_or_default()
    }
}
