use crate::registry::CapabilityRegistry;
use assay_core::AssayResult;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Worker liveness derived from the age of its last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Heartbeat within the staleness threshold.
    Alive,
    /// Heartbeat older than the threshold but within twice the threshold.
    Stale,
    /// No heartbeat, or one older than twice the threshold.
    Offline,
}

/// Health of one registered capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityHealth {
    pub capability: String,
    pub display_name: String,
    pub queue_name: String,
    pub liveness: Liveness,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Tracks worker heartbeats keyed by `{healthPrefix}:heartbeat`.
pub struct HeartbeatMonitor {
    registry: Arc<CapabilityRegistry>,
    stale_after: ChronoDuration,
    beats: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<CapabilityRegistry>, stale_after: Duration) -> Self {
        Self {
            registry,
            stale_after: ChronoDuration::from_std(stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(300)),
            beats: RwLock::new(HashMap::new()),
        }
    }

    /// Record a heartbeat for a capability key or alias at the current time.
    pub fn record(&self, capability: &str) -> AssayResult<DateTime<Utc>> {
        self.record_at(capability, Utc::now())
    }

    /// Record a heartbeat with an explicit timestamp.
    pub fn record_at(&self, capability: &str, at: DateTime<Utc>) -> AssayResult<DateTime<Utc>> {
        let agent = self.registry.resolve(capability)?;
        let key = agent.heartbeat_key();
        debug!(capability = %agent.key, %key, "Heartbeat received");
        self.beats.write().insert(key, at);
        Ok(at)
    }

    fn classify(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Liveness {
        match last {
            None => Liveness::Offline,
            Some(t) => {
                let age = now - t;
                if age <= self.stale_after {
                    Liveness::Alive
                } else if age <= self.stale_after * 2 {
                    Liveness::Stale
                } else {
                    Liveness::Offline
                }
            }
        }
    }

    /// Liveness of one capability at `now`.
    pub fn liveness(&self, capability: &str, now: DateTime<Utc>) -> AssayResult<Liveness> {
        let agent = self.registry.resolve(capability)?;
        let last = self.beats.read().get(&agent.heartbeat_key()).copied();
        Ok(self.classify(last, now))
    }

    /// Health of every registered capability, in registry order.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<CapabilityHealth> {
        let beats = self.beats.read();
        self.registry
            .list_all()
            .iter()
            .map(|agent| {
                let last = beats.get(&agent.heartbeat_key()).copied();
                CapabilityHealth {
                    capability: agent.key.clone(),
                    display_name: agent.display_name.clone(),
                    queue_name: agent.queue_name.clone(),
                    liveness: self.classify(last, now),
                    last_heartbeat: last,
                }
            })
            .collect()
    }
}
