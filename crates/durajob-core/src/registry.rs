//! Worker Registry: a process-wide name -> (handler, options) map.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::QueueError;

/// A worker or lifecycle-hook callable. `id` is the job id; `payload` is the
/// job's JSON payload, opaque to the core.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, id: &str, payload: serde_json::Value) -> Result<(), QueueError>;
}

/// Adapts a plain async closure into a [`Handler`], so callers can
/// `add_worker("email:send", FnHandler(|id, payload| async move { .. }))`
/// instead of hand-writing a struct + `impl Handler` every time.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(String, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    async fn call(&self, id: &str, payload: serde_json::Value) -> Result<(), QueueError> {
        (self.0)(id.to_string(), payload).await
    }
}

/// Options recognized by `add_worker`.
#[derive(Clone)]
pub struct WorkerOptions {
    /// Maximum jobs of this name processed in parallel per batch.
    pub concurrency: u32,
    pub on_start: Option<Arc<dyn Handler>>,
    pub on_success: Option<Arc<dyn Handler>>,
    pub on_failure: Option<Arc<dyn Handler>>,
    pub on_failed: Option<Arc<dyn Handler>>,
    pub on_complete: Option<Arc<dyn Handler>>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            on_start: None,
            on_success: None,
            on_failure: None,
            on_failed: None,
            on_complete: None,
        }
    }
}

struct WorkerEntry {
    handler: Arc<dyn Handler>,
    options: WorkerOptions,
}

/// Process-wide map from worker name to its handler and options. Stateless
/// w.r.t. jobs; scheduler instances share one registry. Registration
/// mutations race harmlessly with in-flight job processing because
/// `process_job` snapshots the handler `Arc` at dispatch time.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Rejects an empty `name`.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        options: WorkerOptions,
    ) -> Result<(), QueueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(QueueError::InvalidArgument(
                "worker name must be non-empty".into(),
            ));
        }
        self.workers.insert(name, WorkerEntry { handler, options });
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.workers.remove(name);
    }

    pub fn lookup(&self, name: &str) -> Result<(Arc<dyn Handler>, WorkerOptions), QueueError> {
        self.workers
            .get(name)
            .map(|entry| (entry.handler.clone(), entry.options.clone()))
            .ok_or_else(|| QueueError::NoWorker(name.to_string()))
    }

    pub fn concurrency_of(&self, name: &str) -> Result<u32, QueueError> {
        self.workers
            .get(name)
            .map(|entry| entry.options.concurrency)
            .ok_or_else(|| QueueError::NoWorker(name.to_string()))
    }
}
