//! Trace events and their bounded in-memory store.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default ring capacity.
pub const DEFAULT_TRACE_CAPACITY: usize = 10_000;

/// What a trace event marks in a request's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceKind {
    #[serde(rename = "request.start")]
    RequestStart,
    #[serde(rename = "attempt")]
    Attempt,
    #[serde(rename = "request.end")]
    RequestEnd,
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestStart => write!(f, "request.start"),
            Self::Attempt => write!(f, "attempt"),
            Self::RequestEnd => write!(f, "request.end"),
        }
    }
}

/// One trace event, correlated by request-id and trace-id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub trace_id: String,
    pub kind: TraceKind,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl TraceEvent {
    pub fn new(
        request_id: impl Into<String>,
        trace_id: impl Into<String>,
        kind: TraceKind,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            trace_id: trace_id.into(),
            kind,
            attributes,
        }
    }
}

/// Bounded ring buffer of trace events.
pub struct TraceStore {
    events: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
}

impl TraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: TraceEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent `n` events, newest last.
    pub fn recent(&self, n: usize) -> Vec<TraceEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().rev().take(n).rev().cloned().collect()
    }

    /// All events recorded for one request, in insertion order.
    pub fn for_request(&self, request_id: &str) -> Vec<TraceEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect()
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn kind_serializes_with_dotted_names() {
        assert_eq!(
            serde_json::to_string(&TraceKind::RequestStart).unwrap(),
            "\"request.start\""
        );
        assert_eq!(serde_json::to_string(&TraceKind::Attempt).unwrap(), "\"attempt\"");
    }

    #[test]
    fn request_lifecycle_is_ordered() {
        let store = TraceStore::new(100);
        store.push(TraceEvent::new("r1", "t1", TraceKind::RequestStart, attrs(&[])));
        store.push(TraceEvent::new(
            "r1",
            "t1",
            TraceKind::Attempt,
            attrs(&[("provider", json!("openai"))]),
        ));
        store.push(TraceEvent::new("r1", "t1", TraceKind::RequestEnd, attrs(&[])));
        store.push(TraceEvent::new("r2", "t2", TraceKind::RequestStart, attrs(&[])));

        let events = store.for_request("r1");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, TraceKind::RequestStart);
        assert_eq!(events[1].kind, TraceKind::Attempt);
        assert_eq!(events[1].attributes["provider"], json!("openai"));
        assert_eq!(events[2].kind, TraceKind::RequestEnd);
    }

    #[test]
    fn ring_evicts_oldest() {
        let store = TraceStore::new(2);
        store.push(TraceEvent::new("r1", "t", TraceKind::RequestStart, attrs(&[])));
        store.push(TraceEvent::new("r2", "t", TraceKind::RequestStart, attrs(&[])));
        store.push(TraceEvent::new("r3", "t", TraceKind::RequestStart, attrs(&[])));

        assert_eq!(store.len(), 2);
        assert!(store.for_request("r1").is_empty());
        assert_eq!(store.for_request("r3").len(), 1);
    }
}
