use crate::registry::CapabilityRegistry;
use crate::transport::WorkerTransport;
use crate::types::{ExecutionMode, FailureReason, Scenario, ScenarioResult, ScenarioStatus};
use assay_core::{AssayError, DispatchEnvelope, WorkerOutcome};
use assay_resilience::{CircuitBreaker, RetryPolicy};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timing and concurrency limits for one session.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Budget for a single scenario, across all of its retries.
    pub scenario_timeout: Duration,
    /// Budget for the whole session.
    pub session_timeout: Duration,
    /// Cap on concurrently dispatched scenarios. Unbounded when `None`.
    pub max_in_flight: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scenario_timeout: Duration::from_secs(120),
            session_timeout: Duration::from_secs(600),
            max_in_flight: None,
        }
    }
}

/// Everything the coordinator learned from a session.
#[derive(Debug, Clone)]
pub struct CoordinatorReport {
    /// One result per scenario, in decomposition order.
    pub results: Vec<ScenarioResult>,
    /// The session deadline cut at least one scenario short.
    pub session_timed_out: bool,
}

struct Settled {
    result: ScenarioResult,
    session_expired: bool,
}

impl Settled {
    fn new(result: ScenarioResult) -> Self {
        Self {
            result,
            session_expired: false,
        }
    }

    fn expired(result: ScenarioResult) -> Self {
        Self {
            result,
            session_expired: true,
        }
    }
}

/// Dispatches routed scenarios concurrently and collects their results.
///
/// Each dispatch is wrapped as breaker → retry → send → await-with-timeout,
/// so one exhausted retry sequence counts as a single breaker failure.
pub struct ExecutionCoordinator {
    registry: Arc<CapabilityRegistry>,
    transport: Arc<dyn WorkerTransport>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    config: CoordinatorConfig,
    permits: Option<Arc<Semaphore>>,
    live: Arc<Mutex<HashMap<Uuid, ScenarioStatus>>>,
}

/// Marks a scenario dispatched for as long as its worker call is outstanding.
struct LiveEntry {
    live: Arc<Mutex<HashMap<Uuid, ScenarioStatus>>>,
    scenario_id: Uuid,
}

impl LiveEntry {
    fn dispatched(live: &Arc<Mutex<HashMap<Uuid, ScenarioStatus>>>, scenario_id: Uuid) -> Self {
        live.lock().insert(scenario_id, ScenarioStatus::Dispatched);
        Self {
            live: live.clone(),
            scenario_id,
        }
    }
}

impl Drop for LiveEntry {
    fn drop(&mut self) {
        self.live.lock().remove(&self.scenario_id);
    }
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        transport: Arc<dyn WorkerTransport>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        config: CoordinatorConfig,
    ) -> Self {
        let permits = config
            .max_in_flight
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            registry,
            transport,
            breaker,
            retry,
            config,
            permits,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Status of a scenario whose worker call is still outstanding.
    pub fn live_status(&self, scenario_id: Uuid) -> Option<ScenarioStatus> {
        self.live.lock().get(&scenario_id).copied()
    }

    /// Number of scenarios currently awaiting a worker, across sessions.
    pub fn dispatched_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Run every scenario to a settled state.
    ///
    /// Scenarios marked after-previous wait for their predecessor; all other
    /// chains run concurrently. Unroutable scenarios are reported as failed
    /// without being dispatched. When the session deadline passes, pending
    /// awaits are cancelled and reported as timed out.
    pub async fn run(&self, scenarios: &[Scenario]) -> CoordinatorReport {
        let deadline = Instant::now() + self.config.session_timeout;
        let chains = build_chains(scenarios);
        info!(
            scenarios = scenarios.len(),
            chains = chains.len(),
            session_timeout_ms = self.config.session_timeout.as_millis() as u64,
            "Dispatching session"
        );

        let settled: Vec<Settled> = join_all(
            chains
                .into_iter()
                .map(|chain| self.run_chain(chain, deadline)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let session_timed_out = settled.iter().any(|s| s.session_expired);
        let order: HashMap<Uuid, usize> = scenarios
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, i))
            .collect();
        let mut results: Vec<ScenarioResult> = settled.into_iter().map(|s| s.result).collect();
        results.sort_by_key(|r| order.get(&r.scenario_id).copied().unwrap_or(usize::MAX));

        if session_timed_out {
            warn!("Session deadline elapsed before all scenarios settled");
        }
        CoordinatorReport {
            results,
            session_timed_out,
        }
    }

    async fn run_chain(&self, chain: Vec<&Scenario>, deadline: Instant) -> Vec<Settled> {
        let mut settled: Vec<Settled> = Vec::with_capacity(chain.len());
        for scenario in chain {
            let upstream = settled.last().map(|s| &s.result);
            let next = self.run_scenario(scenario, upstream, deadline).await;
            settled.push(next);
        }
        settled
    }

    async fn run_scenario(
        &self,
        scenario: &Scenario,
        upstream: Option<&ScenarioResult>,
        deadline: Instant,
    ) -> Settled {
        let Some(capability) = scenario.assigned_capability.as_deref() else {
            let failure = scenario
                .failure
                .clone()
                .unwrap_or_else(|| FailureReason::new("unroutable", "no capability assigned"));
            return Settled::new(ScenarioResult::not_dispatched(
                scenario,
                ScenarioStatus::Failed,
                failure,
            ));
        };
        let agent = match self.registry.resolve(capability) {
            Ok(agent) => agent,
            Err(e) => {
                return Settled::new(ScenarioResult::not_dispatched(
                    scenario,
                    ScenarioStatus::Failed,
                    FailureReason::from_error(&e),
                ))
            }
        };

        let session_expired = || {
            Settled::expired(ScenarioResult::not_dispatched(
                scenario,
                ScenarioStatus::TimedOut,
                FailureReason::new("dispatch_timeout", "session deadline elapsed"),
            ))
        };
        if Instant::now() >= deadline {
            return session_expired();
        }
        let _permit = match &self.permits {
            Some(permits) => match timeout_at(deadline, permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) => None,
                Err(_) => return session_expired(),
            },
            None => None,
        };

        let started = Instant::now();
        let budget = deadline.min(started + self.config.scenario_timeout);
        let timeout_ms = budget.saturating_duration_since(started).as_millis() as u64;
        let envelope = DispatchEnvelope {
            scenario_id: scenario.id,
            capability: agent.key.clone(),
            payload: scenario_payload(scenario, upstream),
            timeout_seconds: timeout_ms.div_ceil(1000),
        };
        debug!(
            scenario_id = %scenario.id,
            capability = %agent.key,
            queue = %agent.queue_name,
            "Dispatching scenario"
        );
        let _live = LiveEntry::dispatched(&self.live, scenario.id);

        let transport = &self.transport;
        let queue = agent.queue_name.as_str();
        let scenario_id = scenario.id;
        let guarded = self.breaker.execute(&agent.key, || {
            self.retry.retry(|| {
                let envelope = envelope.clone();
                async move {
                    match timeout_at(budget, transport.dispatch(queue, envelope)).await {
                        Ok(result) => result,
                        Err(_) => Err(AssayError::DispatchTimeout {
                            scenario_id,
                            timeout_ms,
                        }),
                    }
                }
            })
        });
        let outcome = timeout_at(deadline, guarded).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut result = ScenarioResult {
            scenario_id,
            title: scenario.title.clone(),
            priority: scenario.priority,
            capability: Some(agent.key.clone()),
            status: ScenarioStatus::Failed,
            score: None,
            detail: None,
            failure: None,
            duration_ms,
        };
        let mut expired = false;
        match outcome {
            Ok(Ok(reply)) => {
                result.detail = reply.detail;
                match reply.status {
                    WorkerOutcome::Succeeded => {
                        result.status = ScenarioStatus::Succeeded;
                        result.score = Some(normalize_score(reply.score));
                    }
                    WorkerOutcome::Failed => {
                        result.failure = Some(FailureReason::new(
                            "worker_failed",
                            result.detail.clone().unwrap_or_else(|| "worker reported failure".into()),
                        ));
                    }
                }
            }
            Ok(Err(e @ AssayError::DispatchTimeout { .. })) => {
                result.status = ScenarioStatus::TimedOut;
                result.failure = Some(FailureReason::from_error(&e));
                expired = Instant::now() >= deadline;
            }
            Ok(Err(e)) => {
                result.failure = Some(FailureReason::from_error(&e));
            }
            Err(_) => {
                result.status = ScenarioStatus::TimedOut;
                result.failure = Some(FailureReason::new(
                    "dispatch_timeout",
                    "session deadline elapsed",
                ));
                expired = true;
            }
        }

        match result.status {
            ScenarioStatus::Succeeded => info!(
                scenario_id = %scenario_id,
                capability = %agent.key,
                score = result.score.unwrap_or_default(),
                duration_ms,
                "Scenario succeeded"
            ),
            status => warn!(
                scenario_id = %scenario_id,
                capability = %agent.key,
                ?status,
                reason = result.failure.as_ref().map(|f| f.kind.as_str()).unwrap_or(""),
                duration_ms,
                "Scenario did not succeed"
            ),
        }
        Settled {
            result,
            session_expired: expired,
        }
    }
}

/// Split scenarios into chains: each after-previous scenario joins the chain
/// of the scenario before it.
fn build_chains(scenarios: &[Scenario]) -> Vec<Vec<&Scenario>> {
    let mut chains: Vec<Vec<&Scenario>> = Vec::new();
    for scenario in scenarios {
        match (scenario.mode, chains.last_mut()) {
            (ExecutionMode::AfterPrevious, Some(chain)) => chain.push(scenario),
            _ => chains.push(vec![scenario]),
        }
    }
    chains
}

/// A succeeded worker that reports no score counts as a full pass.
fn normalize_score(score: Option<f64>) -> f64 {
    match score {
        Some(s) if s.is_finite() => s.clamp(0.0, 1.0),
        Some(_) => 0.0,
        None => 1.0,
    }
}

fn scenario_payload(scenario: &Scenario, upstream: Option<&ScenarioResult>) -> serde_json::Value {
    let upstream = upstream.map(|u| {
        serde_json::json!({
            "scenarioId": u.scenario_id,
            "status": u.status,
            "score": u.score,
            "detail": u.detail,
        })
    });
    serde_json::json!({
        "title": scenario.title,
        "description": scenario.description,
        "priority": scenario.priority,
        "riskScore": scenario.risk_score,
        "complexity": scenario.complexity,
        "upstream": upstream,
    })
}
