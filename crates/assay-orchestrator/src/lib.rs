//! Capability-routed orchestration of QA worker agents.
//!
//! A requirement is decomposed into scenarios, each scenario is routed to a
//! worker capability through the [`CapabilityRegistry`], dispatched
//! concurrently behind per-capability circuit breakers and retries, and the
//! settled results are scored into a single quality verdict.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Session pipeline: submit → decompose → dispatch → verify → finalize.
//! - [`CapabilityRegistry`] — Immutable capability key/alias/complexity lookup table.
//! - [`TaskStore`] — TTL-bounded task records with a monotonic transition guard.
//! - [`DelegationEngine`] — Requirement → scenario decomposition and routing.
//! - [`ExecutionCoordinator`] — Bounded-concurrency dispatch with session timeout.
//! - [`VerificationEngine`] — Deterministic priority-weighted scoring.
//! - [`HeartbeatMonitor`] — Worker liveness from heartbeat timestamps.

/// Bounded-concurrency scenario dispatch.
pub mod coordinator;
/// Requirement decomposition and routing.
pub mod delegation;
/// Session pipeline and builder.
pub mod engine;
/// Worker liveness tracking.
pub mod monitor;
/// Capability registry and default agents.
pub mod registry;
/// Task record store.
pub mod task_store;
/// Worker transports (in-process channels, HTTP).
pub mod transport;
/// Shared orchestration types (TaskRecord, Scenario, VerificationResult, etc.).
pub mod types;
/// Quality verdict scoring.
pub mod verification;

pub use coordinator::{CoordinatorConfig, CoordinatorReport, ExecutionCoordinator};
pub use delegation::DelegationEngine;
pub use engine::{
    CompletionNotifier, HealthReport, Orchestrator, OrchestratorBuilder, OrchestratorConfig,
};
pub use monitor::{CapabilityHealth, HeartbeatMonitor, Liveness};
pub use registry::{default_agents, AgentDefinition, CapabilityRegistry};
pub use task_store::{spawn_sweeper, InMemoryTaskStore, TaskStore};
pub use transport::{HttpWorkerTransport, InProcessTransport, WorkerJob, WorkerTransport};
pub use types::{
    Callback, Confidence, ExecutionMode, FailureReason, Requirement, Scenario, ScenarioResult,
    ScenarioScore, ScenarioStatus, ScenarioSummary, Submission, SubmissionReceipt, TaskOutcome,
    TaskRecord, TaskStatus, VerificationResult,
};
