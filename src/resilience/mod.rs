//! Retry policies, the fill circuit breaker and the durable queue log.

pub mod retry;
pub mod circuit_breaker;
pub mod wal;
