//! Failure-containment primitives for calls to workers and to the upstream LLM.
//!
//! # Main types
//!
//! - [`CircuitBreaker`] — Per-dependency CLOSED/OPEN/HALF_OPEN gate.
//! - [`RetryPolicy`] — Exponential backoff for idempotent calls.
//! - [`GuardedLlm`] — An [`LlmBackend`] wrapped in breaker, retry, and timeout.
//! - [`ShutdownCoordinator`] — Stops intake and drains in-flight sessions.

/// Per-dependency circuit breaker.
pub mod circuit_breaker;
/// Upstream language-model client.
pub mod llm;
/// Exponential-backoff retry policy.
pub mod retry;
/// Graceful shutdown coordination.
pub mod shutdown;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitStatus};
pub use llm::{GuardedLlm, HttpLlmBackend, LlmBackend, LlmConfig};
pub use retry::{is_retryable, RetryPolicy};
pub use shutdown::{InFlightGuard, ShutdownCoordinator};
