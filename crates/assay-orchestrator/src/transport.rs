use assay_core::{AssayError, AssayResult, DispatchEnvelope, WorkerResultEnvelope};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delivers a dispatch envelope to the worker behind a queue and waits for
/// its result. Timeouts are applied by the caller.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn dispatch(
        &self,
        queue: &str,
        envelope: DispatchEnvelope,
    ) -> AssayResult<WorkerResultEnvelope>;
}

/// A dispatch waiting on a worker's queue, with its own reply channel.
pub struct WorkerJob {
    pub envelope: DispatchEnvelope,
    reply: oneshot::Sender<WorkerResultEnvelope>,
}

impl WorkerJob {
    /// Send the result back to the waiting dispatcher. A dispatcher that has
    /// already given up is not an error.
    pub fn respond(self, result: WorkerResultEnvelope) {
        if self.reply.send(result).is_err() {
            debug!("Dispatcher no longer waiting for result");
        }
    }
}

/// Channel-backed transport for workers running in the same process.
#[derive(Default)]
pub struct InProcessTransport {
    queues: RwLock<HashMap<String, mpsc::Sender<WorkerJob>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a queue and return its consumer side.
    pub fn register_queue(&self, queue: &str, buffer: usize) -> mpsc::Receiver<WorkerJob> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.queues.write().insert(queue.to_string(), tx);
        rx
    }

    /// Register a queue and serve it with `handler`, one job at a time per
    /// spawned task.
    pub fn spawn_worker<F, Fut>(&self, queue: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(DispatchEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkerResultEnvelope> + Send + 'static,
    {
        let mut rx = self.register_queue(queue, 64);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let fut = handler(job.envelope.clone());
                tokio::spawn(async move {
                    let result = fut.await;
                    job.respond(result);
                });
            }
            debug!(%queue, "Worker queue closed");
        })
    }
}

#[async_trait]
impl WorkerTransport for InProcessTransport {
    async fn dispatch(
        &self,
        queue: &str,
        envelope: DispatchEnvelope,
    ) -> AssayResult<WorkerResultEnvelope> {
        let sender = self
            .queues
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| AssayError::Worker(format!("no worker listening on '{queue}'")))?;

        let (reply, rx) = oneshot::channel();
        sender
            .send(WorkerJob { envelope, reply })
            .await
            .map_err(|_| AssayError::Worker(format!("queue '{queue}' is closed")))?;
        rx.await
            .map_err(|_| AssayError::Worker(format!("worker on '{queue}' dropped the job")))
    }
}

/// Posts envelopes to `{base_url}/queues/{queue}` and reads the result from
/// the response body.
pub struct HttpWorkerTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpWorkerTransport {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> AssayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AssayError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn dispatch(
        &self,
        queue: &str,
        envelope: DispatchEnvelope,
    ) -> AssayResult<WorkerResultEnvelope> {
        let url = format!("{}/queues/{}", self.base_url, queue);
        let scenario_id = envelope.scenario_id;
        let resp = self
            .http
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| AssayError::Http(e.to_string()))?;

        let status = resp.status();
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%url, %status, "Worker rejected dispatch");
            return Err(AssayError::WorkerRejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(AssayError::Http(format!("worker endpoint returned {status}")));
        }

        let result: WorkerResultEnvelope = resp
            .json()
            .await
            .map_err(|e| AssayError::Worker(format!("malformed worker result: {e}")))?;
        if result.scenario_id != scenario_id {
            return Err(AssayError::Worker(format!(
                "result for {} does not match dispatched scenario {scenario_id}",
                result.scenario_id
            )));
        }
        Ok(result)
    }
}
