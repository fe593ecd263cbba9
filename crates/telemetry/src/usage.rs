//! Usage records and their bounded in-memory store.
//!
//! The gateway appends one record per successful request; a cost
//! aggregator outside this process drains the buffer asynchronously.
//! The store is per-instance state: a mutex around a bounded ring where
//! the oldest record is evicted first.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default ring capacity.
pub const DEFAULT_USAGE_CAPACITY: usize = 10_000;

/// One accounted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub api_key_name: String,
    pub api_type: String,
    pub model: String,
    pub provider: String,
    pub status: String,
    pub total_tokens: u32,
    pub latency_ms: u64,
}

/// Bounded ring buffer of usage records.
pub struct UsageStore {
    records: Mutex<VecDeque<UsageRecord>>,
    capacity: usize,
}

impl UsageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, evicting the oldest when full. Never blocks on
    /// anything but the buffer mutex.
    pub fn push(&self, record: UsageRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent `n` records, newest last.
    pub fn recent(&self, n: usize) -> Vec<UsageRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().rev().take(n).rev().cloned().collect()
    }

    /// Drain every buffered record, oldest first.
    pub fn drain(&self) -> Vec<UsageRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.drain(..).collect()
    }
}

impl Default for UsageStore {
    fn default() -> Self {
        Self::new(DEFAULT_USAGE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str, tokens: u32) -> UsageRecord {
        UsageRecord {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            api_key_name: "alice".into(),
            api_type: "chat".into(),
            model: "gpt-4o-mini".into(),
            provider: "openai".into(),
            status: "success".into(),
            total_tokens: tokens,
            latency_ms: 42,
        }
    }

    #[test]
    fn push_and_recent() {
        let store = UsageStore::new(10);
        store.push(record("r1", 10));
        store.push(record("r2", 20));

        let recent = store.recent(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "r1");
        assert_eq!(recent[1].request_id, "r2");
    }

    #[test]
    fn oldest_evicted_at_capacity() {
        let store = UsageStore::new(3);
        for i in 0..5 {
            store.push(record(&format!("r{i}"), i));
        }
        assert_eq!(store.len(), 3);
        let recent = store.recent(3);
        assert_eq!(recent[0].request_id, "r2");
        assert_eq!(recent[2].request_id, "r4");
    }

    #[test]
    fn drain_empties_buffer() {
        let store = UsageStore::new(10);
        store.push(record("r1", 1));
        store.push(record("r2", 2));

        let drained = store.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].request_id, "r1");
        assert!(store.is_empty());
    }
}
