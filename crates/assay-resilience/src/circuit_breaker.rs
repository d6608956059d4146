use assay_core::{AssayError, AssayResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Thresholds shared by every circuit a breaker manages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before allowing a trial call.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    /// Recovery timeout as a `Duration`.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Gate position of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// A single trial call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "CLOSED"),
            CircuitStatus::Open => write!(f, "OPEN"),
            CircuitStatus::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct CircuitState {
    state: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    /// Bumped on every state change; outcomes of calls admitted under an
    /// older generation are ignored.
    generation: u64,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            state: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_utc: None,
            trial_in_flight: false,
            generation: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitStatus::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.trial_in_flight = false;
        self.generation = self.generation.wrapping_add(1);
    }

    fn close(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self::closed();
        self.generation = generation;
    }
}

/// Point-in-time copy of one circuit, for the health surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Protected dependency (capability key or `llm`).
    pub dependency_id: String,
    /// Gate position at snapshot time.
    pub state: CircuitStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// Failures needed to trip.
    pub failure_threshold: u32,
    /// Wait before a trial call.
    pub recovery_timeout_secs: u64,
}

/// Per-dependency circuit breaker.
///
/// Each dependency has its own lock; breakers for different dependencies never
/// block each other. The lock is held only to read or update state, never
/// across the protected call.
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<CircuitState>>>>,
}

impl CircuitBreaker {
    /// Create a breaker; circuits are created lazily per dependency.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    /// Thresholds in effect.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Make sure a circuit exists for `dependency` so it shows up in snapshots
    /// before its first call.
    pub fn register(&self, dependency: &str) {
        let _ = self.circuit(dependency);
    }

    fn circuit(&self, dependency: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(cell) = self.circuits.read().get(dependency) {
            return cell.clone();
        }
        self.circuits
            .write()
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::closed())))
            .clone()
    }

    /// Run `op` through the circuit for `dependency`.
    ///
    /// Returns [`AssayError::CircuitOpen`] without invoking `op` while the
    /// circuit is open and its recovery timeout has not elapsed. Any error
    /// returned by `op` counts as a failure.
    pub async fn execute<T, F, Fut>(&self, dependency: &str, op: F) -> AssayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AssayResult<T>>,
    {
        let cell = self.circuit(dependency);
        let mut guard = self.admit(dependency, &cell)?;

        let result = op().await;
        guard.settled = true;

        match &result {
            Ok(_) => self.on_success(dependency, &guard),
            Err(e) => self.on_failure(dependency, &guard, e),
        }
        result
    }

    fn admit(&self, dependency: &str, cell: &Arc<Mutex<CircuitState>>) -> AssayResult<TrialGuard> {
        let mut state = cell.lock();
        let mut trial = false;
        match state.state {
            CircuitStatus::Closed => {}
            CircuitStatus::Open => {
                let eligible = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout())
                    .unwrap_or(true);
                if !eligible {
                    return Err(AssayError::CircuitOpen {
                        dependency: dependency.to_string(),
                    });
                }
                state.state = CircuitStatus::HalfOpen;
                state.trial_in_flight = true;
                state.generation = state.generation.wrapping_add(1);
                trial = true;
                info!(dependency, "Circuit half-open: allowing trial call");
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    return Err(AssayError::CircuitOpen {
                        dependency: dependency.to_string(),
                    });
                }
                state.trial_in_flight = true;
                trial = true;
            }
        }
        Ok(TrialGuard {
            cell: cell.clone(),
            generation: state.generation,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, dependency: &str, guard: &TrialGuard) {
        let mut state = guard.cell.lock();
        if state.generation != guard.generation {
            debug!(dependency, "Ignoring stale success");
            return;
        }
        match state.state {
            CircuitStatus::HalfOpen if guard.trial => {
                info!(dependency, "Trial call succeeded, circuit closed");
                state.close();
            }
            CircuitStatus::Closed => state.consecutive_failures = 0,
            _ => {}
        }
    }

    fn on_failure(&self, dependency: &str, guard: &TrialGuard, err: &AssayError) {
        let mut state = guard.cell.lock();
        if state.generation != guard.generation {
            debug!(dependency, error = %err, "Ignoring stale failure");
            return;
        }
        match state.state {
            CircuitStatus::HalfOpen if guard.trial => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.open();
                warn!(dependency, error = %err, "Trial call failed, circuit re-opened");
            }
            CircuitStatus::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.open();
                    warn!(
                        dependency,
                        failures = state.consecutive_failures,
                        error = %err,
                        "Circuit opened"
                    );
                }
            }
            _ => {}
        }
    }

    /// Current gate position of `dependency` (closed if never seen).
    ///
    /// Reported as stored; the OPEN → HALF_OPEN move happens on the next call.
    pub fn status(&self, dependency: &str) -> CircuitStatus {
        self.circuits
            .read()
            .get(dependency)
            .map(|cell| cell.lock().state)
            .unwrap_or(CircuitStatus::Closed)
    }

    /// Snapshot of one circuit.
    pub fn snapshot(&self, dependency: &str) -> CircuitSnapshot {
        let cell = self.circuit(dependency);
        let state = cell.lock();
        CircuitSnapshot {
            dependency_id: dependency.to_string(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            opened_at: state.opened_at_utc,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout_secs,
        }
    }

    /// Snapshots of every known circuit, sorted by dependency id.
    pub fn snapshot_all(&self) -> Vec<CircuitSnapshot> {
        let cells: Vec<(String, Arc<Mutex<CircuitState>>)> = self
            .circuits
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> = cells
            .into_iter()
            .map(|(dependency_id, cell)| {
                let state = cell.lock();
                CircuitSnapshot {
                    dependency_id,
                    state: state.state,
                    consecutive_failures: state.consecutive_failures,
                    opened_at: state.opened_at_utc,
                    failure_threshold: self.config.failure_threshold,
                    recovery_timeout_secs: self.config.recovery_timeout_secs,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.dependency_id.cmp(&b.dependency_id));
        snapshots
    }

    /// Force a circuit back to CLOSED.
    pub fn reset(&self, dependency: &str) {
        let cell = self.circuit(dependency);
        cell.lock().close();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Releases the half-open trial slot if the protected call is dropped before
/// it settles (e.g. its session timed out).
struct TrialGuard {
    cell: Arc<Mutex<CircuitState>>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut state = self.cell.lock();
            if state.generation == self.generation {
                state.trial_in_flight = false;
            }
        }
    }
}
