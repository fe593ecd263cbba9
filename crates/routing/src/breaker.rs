//! Per-(provider, upstream-model) circuit breaker.
//!
//! Each cell is small enough to keep its state inline behind its own
//! mutex; there is no cross-cell locking. Transitions:
//! closed → open after N consecutive failures, open → half-open once the
//! open interval elapses, half-open → closed on a successful probe or
//! back to open on a failed one. At most one probe is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Observable circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CellInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// One circuit cell. All mutation happens under the cell's mutex.
pub struct CircuitCell {
    provider: String,
    model: String,
    config: BreakerConfig,
    inner: Mutex<CellInner>,
}

impl CircuitCell {
    fn new(provider: String, model: String, config: BreakerConfig) -> Self {
        Self {
            provider,
            model,
            config,
            inner: Mutex::new(CellInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask permission to call the candidate. `false` means the circuit is
    /// blocking this candidate right now.
    ///
    /// An open circuit whose interval has elapsed moves to half-open and
    /// admits exactly one probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    debug!(provider = %self.provider, model = %self.model, "circuit half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call: resets the failure counter and closes the
    /// circuit from half-open.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::HalfOpen {
            debug!(provider = %self.provider, model = %self.model, "probe succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(provider = %self.provider, model = %self.model, "probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        provider = %self.provider,
                        model = %self.model,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    fn snapshot(&self) -> CellSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CellSnapshot {
            provider: self.provider.clone(),
            model: self.model.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_since_failure: inner.last_failure.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// Point-in-time view of one cell, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CellSnapshot {
    pub provider: String,
    pub model: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub seconds_since_failure: Option<u64>,
}

/// The cell registry. Cells are created lazily on first access.
pub struct CircuitBreaker {
    config: BreakerConfig,
    cells: Mutex<HashMap<(String, String), Arc<CircuitCell>>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// The cell for a (provider, upstream-model) pair.
    pub fn cell(&self, provider: &str, model: &str) -> Arc<CircuitCell> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| {
                Arc::new(CircuitCell::new(
                    provider.to_string(),
                    model.to_string(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Snapshots of every known cell, for the status endpoint.
    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<_> = cells.values().map(|c| c.snapshot()).collect();
        snapshots.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        snapshots
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
