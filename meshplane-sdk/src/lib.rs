//! Plugin-side building blocks: the wire DTOs shared with the host, a thin RPC client
//! shim, the in-memory transport used by the in-process launch strategy, and the circuit
//! breaker resilience primitive shared by both sides of the connection.

pub mod circuit_breaker;
pub mod client;
pub mod common;
pub mod error;
pub mod protocol;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{PluginClient, PluginClientConfig};
pub use error::PluginClientError;
