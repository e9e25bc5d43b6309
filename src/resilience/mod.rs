//! Failure containment.
//!
//! The circuit breaker pauses new entries after a run of order-placement
//! failures; the connection monitor turns event-channel silence into a
//! health grade the engine can act on. Protective and exit paths bypass
//! both on purpose.

pub mod circuit_breaker;
pub mod connection;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use connection::{ConnectionHealth, ConnectionMonitor};
