//! Routing for ModelRelay: candidate tables, circuit breaking, and the
//! dispatch loop with its retry budget.

pub mod breaker;
pub mod router;
pub mod table;

pub use breaker::{BreakerConfig, CellSnapshot, CircuitBreaker, CircuitCell, CircuitState};
pub use router::{AdapterRegistry, Attempt, AttemptStatus, DispatchOutcome, Router};
pub use table::{Candidate, RoutingTable};
