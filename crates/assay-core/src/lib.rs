//! Core types and error definitions for the Assay orchestrator.
//!
//! This crate provides the foundational types shared across all Assay crates:
//! the unified error taxonomy, scenario priorities, complexity classes, and the
//! envelopes exchanged with worker processes.
//!
//! # Main types
//!
//! - [`AssayError`] — Unified error enum covering routing, resilience, and task lifecycle.
//! - [`AssayResult`] — Convenience alias for `Result<T, AssayError>`.
//! - [`Priority`] — Scenario priority, which also carries the verdict weight.
//! - [`ComplexityClass`] — Coarse routing class used when a scenario has no capability tag.
//! - [`DispatchEnvelope`] / [`WorkerResultEnvelope`] — Orchestrator ↔ worker wire format.

/// Worker dispatch and result envelopes.
pub mod envelope;

pub use envelope::{DispatchEnvelope, WorkerOutcome, WorkerResultEnvelope};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Assay orchestrator.
///
/// The first five variants form the failure taxonomy visible to callers; the
/// remaining ones wrap lower-level failures from transports and configuration.
#[derive(Debug, thiserror::Error)]
pub enum AssayError {
    /// No registered capability resolves a scenario. Surfaced immediately, never retried.
    #[error("Unroutable scenario '{scenario}': {reason}")]
    Unroutable {
        /// Title or id of the scenario that could not be routed.
        scenario: String,
        /// Why resolution failed.
        reason: String,
    },

    /// The dependency's circuit is open; the call was rejected without being attempted.
    #[error("Circuit open for dependency '{dependency}'")]
    CircuitOpen {
        /// The protected dependency (capability key or `llm`).
        dependency: String,
    },

    /// A worker did not answer within the scenario's budget.
    #[error("Dispatch of scenario {scenario_id} timed out after {timeout_ms}ms")]
    DispatchTimeout {
        /// The scenario whose dispatch timed out.
        scenario_id: Uuid,
        /// The budget that elapsed.
        timeout_ms: u64,
    },

    /// A task record was asked to move backward or to leave a terminal state.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task whose transition was rejected.
        task_id: Uuid,
        /// Status at the time of the attempt.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A completion webhook could not be delivered. Logged only.
    #[error("Webhook delivery failed: {0}")]
    WebhookDeliveryFailed(String),

    /// A keyed lookup found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A worker transport failed (channel closed, bad response, ...).
    #[error("Worker error: {0}")]
    Worker(String),

    /// A worker refused the dispatch outright (4xx). Not retried.
    #[error("Worker rejected dispatch: {0}")]
    WorkerRejected(String),

    /// The upstream language-model call failed.
    #[error("LLM error: {0}")]
    Llm(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestration pipeline itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// The process is draining and no longer accepts work.
    #[error("Shutting down: new work is not accepted")]
    ShuttingDown,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AssayError {
    /// Short machine-readable kind, used in task outcomes and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AssayError::Unroutable { .. } => "unroutable",
            AssayError::CircuitOpen { .. } => "circuit_open",
            AssayError::DispatchTimeout { .. } => "dispatch_timeout",
            AssayError::InvalidTransition { .. } => "invalid_transition",
            AssayError::WebhookDeliveryFailed(_) => "webhook_delivery_failed",
            AssayError::NotFound(_) => "not_found",
            AssayError::Worker(_) => "worker",
            AssayError::WorkerRejected(_) => "worker_rejected",
            AssayError::Llm(_) => "llm",
            AssayError::Http(_) => "http",
            AssayError::Config(_) => "config",
            AssayError::Orchestrator(_) => "orchestrator",
            AssayError::ShuttingDown => "shutting_down",
            AssayError::Json(_) => "json",
            AssayError::Io(_) => "io",
        }
    }
}

/// A convenience `Result` alias using [`AssayError`].
pub type AssayResult<T> = Result<T, AssayError>;

// --- Routing types ---

/// Priority of a scenario. Also determines its weight in the quality verdict.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Nice-to-have coverage.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Important behaviour.
    High,
    /// Release-blocking behaviour.
    Critical,
}

impl Priority {
    /// Verdict weight: critical=4, high=3, medium=2, low=1.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Critical => 4.0,
            Priority::High => 3.0,
            Priority::Medium => 2.0,
            Priority::Low => 1.0,
        }
    }

    /// Parses a priority name case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Complexity class of an agent, used as the fallback router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityClass {
    /// Cheap, broad checks.
    Low,
    /// Moderately involved analysis.
    Medium,
    /// Deep, expensive analysis.
    High,
}

impl ComplexityClass {
    /// Maps a risk score in `[0, 1]` onto a class (≥0.7 high, ≥0.4 medium, else low).
    pub fn from_risk(risk: f64) -> Self {
        if risk >= 0.7 {
            ComplexityClass::High
        } else if risk >= 0.4 {
            ComplexityClass::Medium
        } else {
            ComplexityClass::Low
        }
    }
}

impl std::fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplexityClass::Low => write!(f, "low"),
            ComplexityClass::Medium => write!(f, "medium"),
            ComplexityClass::High => write!(f, "high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_weights() {
        assert_eq!(Priority::Critical.weight(), 4.0);
        assert_eq!(Priority::High.weight(), 3.0);
        assert_eq!(Priority::Medium.weight(), 2.0);
        assert_eq!(Priority::Low.weight(), 1.0);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("CRITICAL"), Some(Priority::Critical));
        assert_eq!(Priority::parse(" low "), Some(Priority::Low));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_complexity_from_risk() {
        assert_eq!(ComplexityClass::from_risk(0.95), ComplexityClass::High);
        assert_eq!(ComplexityClass::from_risk(0.7), ComplexityClass::High);
        assert_eq!(ComplexityClass::from_risk(0.5), ComplexityClass::Medium);
        assert_eq!(ComplexityClass::from_risk(0.1), ComplexityClass::Low);
    }

    #[test]
    fn test_error_kind() {
        let err = AssayError::CircuitOpen {
            dependency: "security-scan".into(),
        };
        assert_eq!(err.kind(), "circuit_open");
        assert!(err.to_string().contains("security-scan"));
    }
}
