use crate::types::{Callback, TaskOutcome, TaskRecord, TaskStatus};
use assay_core::{AssayError, AssayResult};
use assay_resilience::ShutdownCoordinator;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage for task records.
///
/// Every operation is synchronous and never suspends, so a read of one key
/// cannot observe a half-applied transition.
pub trait TaskStore: Send + Sync {
    /// Create a `pending` record and return its id.
    fn create(&self, session_id: Uuid, callback: Option<Callback>) -> Uuid;

    /// Move a record forward. `result` is attached only on terminal statuses.
    fn transition(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<TaskOutcome>,
    ) -> AssayResult<TaskRecord>;

    /// Fetch a record. Expired records are reported as not found.
    fn get(&self, task_id: Uuid) -> AssayResult<TaskRecord>;

    /// Remove a record regardless of its TTL.
    fn purge(&self, task_id: Uuid) -> bool;

    /// Remove every expired record and return how many were dropped.
    fn purge_expired(&self) -> usize;

    /// Number of stored (possibly expired) records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    record: TaskRecord,
    expires_at: Instant,
}

/// In-process [`TaskStore`] with a per-record TTL.
pub struct InMemoryTaskStore {
    entries: Mutex<HashMap<Uuid, Entry>>,
    ttl: Duration,
}

impl InMemoryTaskStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, session_id: Uuid, callback: Option<Callback>) -> Uuid {
        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let record = TaskRecord {
            task_id,
            session_id,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            callback,
        };
        self.entries.lock().insert(
            task_id,
            Entry {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(%task_id, %session_id, "Task created");
        task_id
    }

    fn transition(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<TaskOutcome>,
    ) -> AssayResult<TaskRecord> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&task_id)
            .filter(|e| e.expires_at > Instant::now())
            .ok_or_else(|| AssayError::NotFound(format!("task {task_id}")))?;

        let from = entry.record.status;
        if !from.can_transition_to(status) {
            warn!(%task_id, %from, to = %status, "Rejected task transition");
            return Err(AssayError::InvalidTransition {
                task_id,
                from: from.to_string(),
                to: status.to_string(),
            });
        }

        entry.record.status = status;
        entry.record.updated_at = Utc::now();
        if status.is_terminal() {
            entry.record.result = result;
        }
        info!(%task_id, %from, to = %status, "Task transitioned");
        Ok(entry.record.clone())
    }

    fn get(&self, task_id: Uuid) -> AssayResult<TaskRecord> {
        let entries = self.entries.lock();
        entries
            .get(&task_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.record.clone())
            .ok_or_else(|| AssayError::NotFound(format!("task {task_id}")))
    }

    fn purge(&self, task_id: Uuid) -> bool {
        self.entries.lock().remove(&task_id).is_some()
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Periodically purge expired records until shutdown is triggered.
pub fn spawn_sweeper(
    store: Arc<dyn TaskStore>,
    interval: Duration,
    shutdown: ShutdownCoordinator,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        info!(purged, remaining = store.len(), "Purged expired tasks");
                    }
                }
                _ = shutdown.triggered() => {
                    debug!("Task sweeper stopping");
                    break;
                }
            }
        }
    })
}
