use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message sent from the orchestrator to a worker's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    /// Scenario this dispatch belongs to; echoed back in the result.
    pub scenario_id: Uuid,
    /// Capability key the worker is expected to exercise.
    pub capability: String,
    /// Scenario-specific input (title, description, upstream results, ...).
    pub payload: serde_json::Value,
    /// Budget the worker has to answer.
    pub timeout_seconds: u64,
}

/// Terminal status reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerOutcome {
    /// The worker completed the scenario and produced a score.
    Succeeded,
    /// The worker ran but the scenario failed.
    Failed,
}

/// Message sent from a worker back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResultEnvelope {
    /// The scenario this result answers.
    pub scenario_id: Uuid,
    /// Whether the worker succeeded.
    pub status: WorkerOutcome,
    /// Fuzzy score in `[0, 1]`, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Free-form detail from the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WorkerResultEnvelope {
    /// A successful result with the given score.
    pub fn succeeded(scenario_id: Uuid, score: f64, detail: impl Into<String>) -> Self {
        Self {
            scenario_id,
            status: WorkerOutcome::Succeeded,
            score: Some(score),
            detail: Some(detail.into()),
        }
    }

    /// A failed result with the given detail.
    pub fn failed(scenario_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            scenario_id,
            status: WorkerOutcome::Failed,
            score: None,
            detail: Some(detail.into()),
        }
    }
}
