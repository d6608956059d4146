use crate::coordinator::{CoordinatorConfig, ExecutionCoordinator};
use crate::delegation::DelegationEngine;
use crate::monitor::{CapabilityHealth, HeartbeatMonitor, Liveness};
use crate::registry::CapabilityRegistry;
use crate::task_store::{InMemoryTaskStore, TaskStore};
use crate::transport::WorkerTransport;
use crate::types::{
    Callback, Requirement, Scenario, ScenarioStatus, ScenarioSummary, Submission,
    SubmissionReceipt, TaskOutcome, TaskRecord, TaskStatus,
};
use crate::verification::{VerificationEngine, DEFAULT_VARIANCE_THRESHOLD};
use assay_core::AssayResult;
use assay_resilience::{
    CircuitBreaker, CircuitSnapshot, CircuitStatus, GuardedLlm, RetryPolicy, ShutdownCoordinator,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use uuid::Uuid;

/// Delivers the terminal task record to the submitter's callback.
///
/// Delivery is fire-and-forget: implementations log failures and never
/// affect the stored record.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, record: &TaskRecord, callback: &Callback);
}

/// Session timing, capacity, and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_scenario_timeout_secs")]
    pub scenario_timeout_secs: u64,
    /// Cap on concurrently dispatched scenarios per session.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,
}

fn default_session_timeout_secs() -> u64 {
    600
}

fn default_scenario_timeout_secs() -> u64 {
    120
}

fn default_task_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_heartbeat_stale_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_variance_threshold() -> f64 {
    DEFAULT_VARIANCE_THRESHOLD
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout_secs(),
            scenario_timeout_secs: default_scenario_timeout_secs(),
            max_in_flight: None,
            task_ttl_secs: default_task_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            variance_threshold: default_variance_threshold(),
        }
    }
}

impl OrchestratorConfig {
    fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            scenario_timeout: Duration::from_secs(self.scenario_timeout_secs),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            max_in_flight: self.max_in_flight,
        }
    }
}

/// Health of the whole orchestrator, as served on `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok`, `degraded` (some circuit not closed or worker not alive), or `draining`.
    pub status: String,
    pub capabilities: Vec<CapabilityHealth>,
    pub circuits: Vec<CircuitSnapshot>,
    pub stored_tasks: usize,
    pub in_flight_sessions: usize,
    /// Scenarios currently awaiting a worker.
    pub dispatched_scenarios: usize,
}

/// Assembles an [`Orchestrator`] from its collaborators.
pub struct OrchestratorBuilder {
    registry: Arc<CapabilityRegistry>,
    transport: Arc<dyn WorkerTransport>,
    config: OrchestratorConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: RetryPolicy,
    store: Option<Arc<dyn TaskStore>>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
    llm: Option<Arc<GuardedLlm>>,
    shutdown: ShutdownCoordinator,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a breaker, e.g. with a [`GuardedLlm`].
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn llm(mut self, llm: Arc<GuardedLlm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> AssayResult<Arc<Orchestrator>> {
        let breaker = self.breaker.unwrap_or_default();
        for agent in self.registry.list_all() {
            breaker.register(&agent.key);
        }
        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemoryTaskStore::new(Duration::from_secs(
                self.config.task_ttl_secs,
            )))
        });

        let mut verification =
            VerificationEngine::new().with_variance_threshold(self.config.variance_threshold);
        if let Some(llm) = self.llm {
            verification = verification.with_llm(llm);
        }

        Ok(Arc::new(Orchestrator {
            delegation: DelegationEngine::new(self.registry.clone())?,
            coordinator: ExecutionCoordinator::new(
                self.registry.clone(),
                self.transport,
                breaker.clone(),
                self.retry,
                self.config.coordinator(),
            ),
            monitor: Arc::new(HeartbeatMonitor::new(
                self.registry.clone(),
                Duration::from_secs(self.config.heartbeat_stale_secs),
            )),
            registry: self.registry,
            store,
            verification,
            breaker,
            notifier: self.notifier,
            shutdown: self.shutdown,
            config: self.config,
        }))
    }
}

/// The QA orchestrator.
///
/// Implements the submit → decompose → dispatch → verify → finalize pipeline.
/// Each accepted submission runs as its own session task; the caller polls
/// the task record or receives a webhook on completion.
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn TaskStore>,
    delegation: DelegationEngine,
    coordinator: ExecutionCoordinator,
    verification: VerificationEngine,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<HeartbeatMonitor>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
    shutdown: ShutdownCoordinator,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn builder(
        registry: Arc<CapabilityRegistry>,
        transport: Arc<dyn WorkerTransport>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            transport,
            config: OrchestratorConfig::default(),
            breaker: None,
            retry: RetryPolicy::default(),
            store: None,
            notifier: None,
            llm: None,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Accept a submission and start its session in the background.
    ///
    /// Decomposition happens before returning, so unroutable scenarios are
    /// visible in the receipt. Fails with `ShuttingDown` while draining.
    pub fn submit(self: &Arc<Self>, submission: Submission) -> AssayResult<SubmissionReceipt> {
        let guard = self.shutdown.track()?;
        let (task_id, session_id, scenarios) = self.accept(&submission);
        let receipt = SubmissionReceipt {
            task_id,
            session_id,
            status: TaskStatus::Pending,
            scenarios: scenarios.iter().map(ScenarioSummary::from).collect(),
        };

        let this = Arc::clone(self);
        let requirement = submission.requirement;
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.run_session(task_id, &requirement, scenarios).await {
                error!(%task_id, error = %e, "Session could not be finalized");
            }
        });
        Ok(receipt)
    }

    /// Accept a submission and run its session to completion inline.
    pub async fn run_to_completion(&self, submission: Submission) -> AssayResult<TaskRecord> {
        let _guard = self.shutdown.track()?;
        let (task_id, _, scenarios) = self.accept(&submission);
        self.run_session(task_id, &submission.requirement, scenarios)
            .await
    }

    fn accept(&self, submission: &Submission) -> (Uuid, Uuid, Vec<Scenario>) {
        let session_id = Uuid::new_v4();
        let task_id = self.store.create(session_id, submission.callback.clone());
        let scenarios = self.delegation.decompose(&submission.requirement);
        info!(
            %task_id,
            %session_id,
            title = %submission.requirement.title,
            scenarios = scenarios.len(),
            "Submission accepted"
        );
        (task_id, session_id, scenarios)
    }

    /// Run one session: dispatch, verify, and record the terminal status.
    async fn run_session(
        &self,
        task_id: Uuid,
        requirement: &Requirement,
        scenarios: Vec<Scenario>,
    ) -> AssayResult<TaskRecord> {
        let start = Instant::now();
        self.store.transition(task_id, TaskStatus::Running, None)?;

        let report = self.coordinator.run(&scenarios).await;
        let verification = self
            .verification
            .verify(&report.results, &requirement.business_goals)
            .await;

        let any_succeeded = report
            .results
            .iter()
            .any(|r| r.status == ScenarioStatus::Succeeded);
        let status = if any_succeeded {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        info!(
            %task_id,
            %status,
            overall_score = verification.overall_score,
            confidence = %verification.confidence,
            session_timed_out = report.session_timed_out,
            duration_ms = start.elapsed().as_millis() as u64,
            "Session finished"
        );

        let outcome = TaskOutcome {
            verification,
            scenarios: report.results,
            session_timed_out: report.session_timed_out,
        };
        let record = self.store.transition(task_id, status, Some(outcome))?;
        self.notify(&record);
        Ok(record)
    }

    fn notify(&self, record: &TaskRecord) {
        let (Some(notifier), Some(callback)) = (&self.notifier, &record.callback) else {
            return;
        };
        let notifier = Arc::clone(notifier);
        let callback = callback.clone();
        let record = record.clone();
        tokio::spawn(async move {
            notifier.notify(&record, &callback).await;
        });
    }

    pub fn get_task(&self, task_id: Uuid) -> AssayResult<TaskRecord> {
        self.store.get(task_id)
    }

    /// Record a worker heartbeat by capability key or alias.
    pub fn record_heartbeat(&self, capability: &str) -> AssayResult<DateTime<Utc>> {
        self.monitor.record(capability)
    }

    pub fn health(&self) -> HealthReport {
        let capabilities = self.monitor.snapshot(Utc::now());
        let circuits = self.breaker.snapshot_all();
        let degraded = circuits.iter().any(|c| c.state != CircuitStatus::Closed)
            || capabilities.iter().any(|c| c.liveness != Liveness::Alive);
        let status = if self.shutdown.is_shutting_down() {
            "draining"
        } else if degraded {
            "degraded"
        } else {
            "ok"
        };
        HealthReport {
            status: status.to_string(),
            capabilities,
            circuits,
            stored_tasks: self.store.len(),
            in_flight_sessions: self.shutdown.in_flight(),
            dispatched_scenarios: self.coordinator.dispatched_count(),
        }
    }
}
