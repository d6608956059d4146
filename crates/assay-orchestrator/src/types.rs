use assay_core::{ComplexityClass, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Position in the lifecycle order `pending < running < {completed, failed}`.
    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a record in `self` may move to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where to deliver the completion notification for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Callback {
    pub url: String,
    /// HMAC key for the `X-Signature` header. Unsigned when absent.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Externally visible state of one submitted requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub session_id: Uuid,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the task reaches a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskOutcome>,
    /// Never serialized: the secret must not leak through the read API.
    #[serde(skip)]
    pub callback: Option<Callback>,
}

/// How a scenario is scheduled relative to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Runs alongside every other chain.
    #[default]
    Parallel,
    /// Starts only after the preceding scenario has settled.
    AfterPrevious,
}

/// Status of a single scenario within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
}

impl ScenarioStatus {
    /// Failed and timed-out scenarios contribute zero to the verdict.
    pub fn is_failure(self) -> bool {
        !matches!(self, ScenarioStatus::Succeeded)
    }
}

/// Machine-readable cause attached to a failed scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Error kind, e.g. `unroutable`, `circuit_open`, `dispatch_timeout`.
    pub kind: String,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn from_error(err: &assay_core::AssayError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// A unit of verification work produced by decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// Capability requested by a tag, before resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_capability: Option<String>,
    /// Canonical capability key. `None` when the scenario is unroutable.
    pub assigned_capability: Option<String>,
    pub risk_score: f64,
    pub complexity: ComplexityClass,
    pub mode: ExecutionMode,
    pub status: ScenarioStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl Scenario {
    pub fn is_routable(&self) -> bool {
        self.assigned_capability.is_some()
    }
}

/// A requirement as fed to decomposition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub target_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub business_goals: Vec<String>,
}

/// An incoming unit of work: a requirement plus its delivery callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(flatten)]
    pub requirement: Requirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<Callback>,
}

/// Short view of a decomposed scenario, returned on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    pub scenario_id: Uuid,
    pub title: String,
    pub priority: Priority,
    pub assigned_capability: Option<String>,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl From<&Scenario> for ScenarioSummary {
    fn from(s: &Scenario) -> Self {
        Self {
            scenario_id: s.id,
            title: s.title.clone(),
            priority: s.priority,
            assigned_capability: s.assigned_capability.clone(),
            mode: s.mode,
            failure: s.failure.clone(),
        }
    }
}

/// Returned immediately when a submission is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub task_id: Uuid,
    pub session_id: Uuid,
    pub status: TaskStatus,
    pub scenarios: Vec<ScenarioSummary>,
}

/// Settled result of one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub scenario_id: Uuid,
    pub title: String,
    pub priority: Priority,
    pub capability: Option<String>,
    pub status: ScenarioStatus,
    /// Worker-reported score in `[0, 1]`; absent unless succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub duration_ms: u64,
}

impl ScenarioResult {
    /// Result for a scenario that never reached a worker.
    pub fn not_dispatched(scenario: &Scenario, status: ScenarioStatus, failure: FailureReason) -> Self {
        Self {
            scenario_id: scenario.id,
            title: scenario.title.clone(),
            priority: scenario.priority,
            capability: scenario.assigned_capability.clone(),
            status,
            score: None,
            detail: None,
            failure: Some(failure),
            duration_ms: 0,
        }
    }
}

/// Confidence in the quality verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

/// One scenario's contribution to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioScore {
    pub score: f64,
    pub priority: Priority,
    /// Set for failed and timed-out scenarios, which score zero.
    pub flagged: bool,
}

/// Quality verdict for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub overall_score: f64,
    pub confidence: Confidence,
    pub business_alignment: String,
    pub per_scenario_scores: BTreeMap<Uuid, ScenarioScore>,
    /// Optional model-written remarks. Never affects the score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary: Option<String>,
}

impl VerificationResult {
    /// Scenario ids that were flagged as failed or timed out.
    pub fn flagged(&self) -> Vec<Uuid> {
        self.per_scenario_scores
            .iter()
            .filter(|(_, s)| s.flagged)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Final result attached to a terminal task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub verification: VerificationResult,
    pub scenarios: Vec<ScenarioResult>,
    /// The session deadline cancelled at least one pending scenario.
    pub session_timed_out: bool,
}
