//! Queue scheduler: job creation, eligibility selection, claim transaction,
//! processing loop, timeout race, retry/failure bookkeeping, and lifespan
//! management.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::job::{CreateJobOptions, Job, JobData};
use crate::registry::{Handler, WorkerOptions, WorkerRegistry};
use crate::store::{JobQuery, PersistenceAdapter};

/// Hard safety buffer: covers claim-transaction-plus-commit latency before
/// the host enforces its own kill deadline.
pub const LIFESPAN_SAFETY_BUFFER_MS: u64 = 500;

/// Typed rendition of the "exactly-zero maps to -1" lifespan sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifespanRemaining {
    /// `start()` was called with `lifespan_ms == 0`: no lifespan predicate.
    Unbounded,
    /// Lifespan mode is active and this much time remains.
    Remaining(Duration),
    /// Lifespan mode is active and the window has fully elapsed (the old
    /// `-1` sentinel).
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Inactive,
    Active,
}

struct RunState {
    status: Status,
    start_time: Option<Instant>,
    lifespan_ms: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: Status::Inactive,
            start_time: None,
            lifespan_ms: 0,
        }
    }
}

/// The durable, priority-ordered, at-least-once job queue.
///
/// Single-threaded cooperative concurrency per instance: `Queue` holds one
/// `Arc<dyn PersistenceAdapter>` as its single shared store handle
/// and a `tokio::sync::Mutex`-guarded run state, so a second overlapping
/// `start()` call observes `status == Active` and returns `false` rather
/// than racing the first loop.
pub struct Queue {
    adapter: Arc<dyn PersistenceAdapter>,
    registry: Arc<WorkerRegistry>,
    default_concurrency: u32,
    state: Mutex<RunState>,
}

impl Queue {
    /// Construct a queue over the given persistence adapter with a fresh,
    /// unshared worker registry.
    pub fn new(adapter: Arc<dyn PersistenceAdapter>) -> Arc<Self> {
        Self::with_registry(adapter, Arc::new(WorkerRegistry::new()))
    }

    /// Construct a queue sharing an existing registry: the registry is
    /// process-wide state multiple scheduler instances may share.
    pub fn with_registry(adapter: Arc<dyn PersistenceAdapter>, registry: Arc<WorkerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            registry,
            default_concurrency: 1,
            state: Mutex::new(RunState::default()),
        })
    }

    /// Override the concurrency used to claim jobs whose name has no
    /// registered worker yet. They still get claimed, so `process_job` can
    /// record the `NoWorker` failure on them; claiming is never gated on
    /// worker presence.
    pub fn with_default_concurrency(mut self: Arc<Self>, concurrency: u32) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_default_concurrency must run before the queue is shared")
            .default_concurrency = concurrency.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    // ---------------------------------------------------------------
    // Worker registry surface
    // ---------------------------------------------------------------

    pub fn add_worker(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        options: WorkerOptions,
    ) -> Result<(), QueueError> {
        self.registry.register(name, handler, options)
    }

    pub fn remove_worker(&self, name: &str) {
        self.registry.unregister(name)
    }

    // ---------------------------------------------------------------
    // Job creation
    // ---------------------------------------------------------------

    /// Create a job. `id` is externally supplied — UUID generation is the
    /// recommended collaborator, but any unique string works.
    pub async fn create_job(
        self: &Arc<Self>,
        id: impl Into<String>,
        name: impl Into<String>,
        payload: impl Serialize,
        options: CreateJobOptions,
        start_queue: bool,
    ) -> Result<Job, QueueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(QueueError::InvalidArgument("job name must be non-empty".into()));
        }

        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| QueueError::store_failure(anyhow::anyhow!("payload encode: {e}")))?;
        let data_json = serde_json::to_string(&JobData::new(options.attempts))
            .map_err(|e| QueueError::store_failure(anyhow::anyhow!("data encode: {e}")))?;

        let now = Utc::now();
        let job = Job {
            id: id.into(),
            name,
            payload: payload_json,
            data: data_json,
            priority: options.priority,
            active: false,
            timeout: options.timeout,
            created: now,
            failed: None,
            next_valid_time: now,
            retry_delay: options.retry_delay,
        };

        {
            let mut tx = self.adapter.begin_write().await?;
            tx.insert(&job).await?;
            tx.commit().await?;
        }

        if start_queue {
            let already_active = self.state.lock().await.status == Status::Active;
            if !already_active {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.start(0, None).await;
                });
            }
        }

        Ok(job)
    }

    // ---------------------------------------------------------------
    // Read & delete operations
    // ---------------------------------------------------------------

    /// Returns every job row. `consistent` is accepted for API parity with
    /// hosts that distinguish eventually-consistent reads; this adapter is
    /// always transactionally consistent (every query runs inside a fresh
    /// `begin_write`/`commit` pair), so both values behave identically here.
    pub async fn get_jobs(&self, _consistent: bool) -> Result<Vec<Job>, QueueError> {
        let mut tx = self.adapter.begin_write().await?;
        let jobs = tx.query(&JobQuery::all()).await?;
        tx.commit().await?;
        Ok(jobs)
    }

    /// Delete all rows matching `name`, or every row if `name` is `None`.
    /// The adapter implementation is responsible for not issuing a
    /// store-level delete when nothing matches.
    pub async fn flush_queue(&self, name: Option<&str>) -> Result<(), QueueError> {
        let mut query = JobQuery::all();
        if let Some(name) = name {
            query = query.with_name(name);
        }
        let mut tx = self.adapter.begin_write().await?;
        tx.delete_many(&query).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete the row with `id` if present; no-op otherwise.
    pub async fn flush_job(&self, id: &str) -> Result<(), QueueError> {
        let mut tx = self.adapter.begin_write().await?;
        tx.delete(id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.stop().await;
        self.adapter.close().await
    }

    // ---------------------------------------------------------------
    // Eligibility & claim
    // ---------------------------------------------------------------

    /// Claim the next batch of eligible jobs. `jobs_limit = None` means
    /// unlimited.
    pub async fn get_concurrent_jobs(
        &self,
        jobs_limit: Option<i64>,
        lifespan_remaining: LifespanRemaining,
    ) -> Result<Vec<Job>, QueueError> {
        // Edge case (a): lifespan mode, but time is already up. Return
        // empty without touching the store.
        if matches!(lifespan_remaining, LifespanRemaining::Expired) {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut base = JobQuery::eligible(now);

        if let LifespanRemaining::Remaining(remaining) = lifespan_remaining {
            let remaining_ms = remaining.as_millis() as u64;
            // timeout_upper = max(lifespan_remaining - 499, 0)
            let timeout_upper = remaining_ms.saturating_sub(LIFESPAN_SAFETY_BUFFER_MS - 1);
            base = base.with_timeout_fits(timeout_upper);
        }

        if let Some(limit) = jobs_limit {
            if limit >= 0 {
                base = base.with_limit(Some(limit));
            }
        }

        let mut tx = self.adapter.begin_write().await?;

        let candidates = tx.query(&base).await?;
        let Some(pivot) = candidates.first() else {
            tx.commit().await?;
            return Ok(Vec::new());
        };

        let concurrency = self
            .registry
            .concurrency_of(&pivot.name)
            .unwrap_or(self.default_concurrency);

        let named_query = base.with_name(pivot.name.clone());
        let mut batch = tx.query(&named_query).await?;
        batch.truncate(concurrency as usize);

        for job in batch.iter_mut() {
            job.active = true;
            tx.update(job).await?;
        }

        tx.commit().await?;
        Ok(batch)
    }

    // ---------------------------------------------------------------
    // Processing a job
    // ---------------------------------------------------------------

    /// Process one claimed job. Returns `Err` only for a [`QueueError::StoreFailure`]
    /// raised while recording the outcome — every other failure mode
    /// (`NoWorker`, `Timeout`, a handler's own error) is absorbed into the
    /// job's row and reported as `Ok(())`.
    pub async fn process_job(self: &Arc<Self>, job: Job) -> Result<(), QueueError> {
        match self.registry.lookup(&job.name) {
            Err(no_worker) => self.complete_failure(&job, no_worker, None).await,
            Ok((handler, options)) => {
                self.fire_hook(&options.on_start, &job.id, &job.payload, "on_start")
                    .await;

                let payload: serde_json::Value = match serde_json::from_str(&job.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        let err = QueueError::HandlerFailure {
                            message: format!("invalid payload json: {e}"),
                        };
                        return self.complete_failure(&job, err, Some(&options)).await;
                    }
                };

                let outcome = self.run_handler(&handler, &job, payload).await;

                match outcome {
                    Ok(()) => self.complete_success(&job, &options).await,
                    Err(e) => self.complete_failure(&job, e, Some(&options)).await,
                }
            }
        }
    }

    /// The timeout race: first of {handler completion, timer elapsed}
    /// wins. The loser is dropped — best-effort cancellation only; jobs are
    /// at-least-once, never exactly-once.
    async fn run_handler(
        &self,
        handler: &Arc<dyn Handler>,
        job: &Job,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        if job.timeout == 0 {
            return handler.call(&job.id, payload).await;
        }

        tokio::select! {
            result = handler.call(&job.id, payload) => result,
            _ = tokio::time::sleep(Duration::from_millis(job.timeout)) => {
                Err(QueueError::Timeout { id: job.id.clone(), ms: job.timeout })
            }
        }
    }

    async fn fire_hook(&self, hook: &Option<Arc<dyn Handler>>, id: &str, payload_json: &str, label: &str) {
        let Some(handler) = hook else { return };
        let value = serde_json::from_str(payload_json).unwrap_or(serde_json::Value::Null);
        if let Err(e) = handler.call(id, value).await {
            tracing::warn!(hook = label, job_id = id, error = %e, "lifecycle hook failed");
        }
    }

    async fn complete_success(&self, job: &Job, options: &WorkerOptions) -> Result<(), QueueError> {
        {
            let mut tx = self.adapter.begin_write().await?;
            tx.delete(&job.id).await?;
            tx.commit().await?;
        }
        tracing::debug!(job_id = %job.id, name = %job.name, "job completed");

        self.fire_hook(&options.on_success, &job.id, &job.payload, "on_success")
            .await;
        self.fire_hook(&options.on_complete, &job.id, &job.payload, "on_complete")
            .await;
        Ok(())
    }

    /// Record the failure, reschedule or terminate, and fire the matching
    /// lifecycle hooks.
    async fn complete_failure(
        self: &Arc<Self>,
        job: &Job,
        error: QueueError,
        options: Option<&WorkerOptions>,
    ) -> Result<(), QueueError> {
        let mut data = job.decode_data().unwrap_or_else(|_| JobData::new(1));
        data.record_failure(error.audit_message());
        let exhausted = data.is_exhausted();

        let now = Utc::now();
        let mut updated = job.clone();
        updated.set_data(&data)?;
        updated.active = false;
        updated.next_valid_time = now + ChronoDuration::milliseconds(job.retry_delay as i64);
        if exhausted {
            updated.failed = Some(now);
        }

        {
            let mut tx = self.adapter.begin_write().await?;
            tx.update(&updated).await?;
            tx.commit().await?;
        }

        if exhausted {
            tracing::info!(job_id = %job.id, name = %job.name, "job terminally failed");
        } else {
            tracing::debug!(job_id = %job.id, name = %job.name, error = %error, "job attempt failed, will retry");
        }

        if let Some(options) = options {
            self.fire_hook(&options.on_failure, &job.id, &job.payload, "on_failure")
                .await;
            if exhausted {
                self.fire_hook(&options.on_failed, &job.id, &job.payload, "on_failed")
                    .await;
            }
            self.fire_hook(&options.on_complete, &job.id, &job.payload, "on_complete")
                .await;
        }

        if job.retry_delay > 0 {
            self.schedule_deferred_restart(job.retry_delay).await;
        }

        Ok(())
    }

    /// Schedule a timer that calls `start(current_lifespan)` again after
    /// `retry_delay` ms, preserving whatever lifespan was active. Survives
    /// an intervening `stop()`.
    async fn schedule_deferred_restart(self: &Arc<Self>, retry_delay_ms: u64) {
        let lifespan_ms = self.state.lock().await.lifespan_ms;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
            this.start(lifespan_ms, None).await;
        });
    }

    // ---------------------------------------------------------------
    // Processing loop
    // ---------------------------------------------------------------

    /// Start the run loop. `lifespan_ms == 0` means unbounded; `max_jobs`
    /// caps how many jobs this call processes before returning. Returns
    /// `false` immediately without side effects if a loop is already active.
    pub async fn start(self: &Arc<Self>, lifespan_ms: u64, max_jobs: Option<u64>) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.status == Status::Active {
                return false;
            }

            let fresh_start = match state.start_time {
                None => true,
                Some(start) => {
                    state.lifespan_ms != 0
                        && start.elapsed().as_millis() as u64 >= state.lifespan_ms
                }
            };
            if fresh_start {
                state.start_time = Some(Instant::now());
            }
            state.lifespan_ms = lifespan_ms;
            state.status = Status::Active;
        }

        self.run_loop(max_jobs.unwrap_or(u64::MAX)).await;
        true
    }

    /// Advisory stop: prevents the *next* batch claim but lets in-flight
    /// handlers in the current batch run to completion, since the loop
    /// only re-checks `status` between batches.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.status = Status::Inactive;
        state.start_time = None;
        state.lifespan_ms = 0;
    }

    async fn is_active(&self) -> bool {
        self.state.lock().await.status == Status::Active
    }

    /// Recomputed on every loop iteration.
    async fn lifespan_remaining(&self) -> LifespanRemaining {
        let state = self.state.lock().await;
        if state.lifespan_ms == 0 {
            return LifespanRemaining::Unbounded;
        }
        let start = state.start_time.unwrap_or_else(Instant::now);
        let elapsed_ms = start.elapsed().as_millis() as i64;
        let remaining_ms = state.lifespan_ms as i64 - elapsed_ms;
        if remaining_ms <= 0 {
            LifespanRemaining::Expired
        } else {
            LifespanRemaining::Remaining(Duration::from_millis(remaining_ms as u64))
        }
    }

    async fn run_loop(self: &Arc<Self>, max_jobs: u64) {
        let mut jobs_processed: u64 = 0;
        let mut remaining = LifespanRemaining::Unbounded;

        loop {
            if !self.is_active().await {
                break;
            }
            remaining = self.lifespan_remaining().await;
            if matches!(remaining, LifespanRemaining::Expired) {
                break;
            }

            let take = max_jobs.saturating_sub(jobs_processed);
            if take == 0 {
                break;
            }
            let limit = if max_jobs == u64::MAX { None } else { Some(take as i64) };

            let batch = match self.get_concurrent_jobs(limit, remaining).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "store failure claiming batch; ending run loop");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len() as u64;
            let futures: Vec<Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>> = batch
                .into_iter()
                .map(|job| {
                    let this = Arc::clone(self);
                    Box::pin(async move { this.process_job(job).await })
                        as Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>
                })
                .collect();

            let outcomes = join_all(futures).await;
            jobs_processed += batch_len;

            let store_failed = outcomes.iter().any(|r| {
                if let Err(e) = r {
                    tracing::error!(error = %e, "store failure recording batch outcome; ending run loop");
                    true
                } else {
                    false
                }
            });
            if store_failed {
                break;
            }
            if jobs_processed >= max_jobs {
                break;
            }
        }

        self.finish_loop(remaining).await;
    }

    async fn finish_loop(&self, remaining: LifespanRemaining) {
        let mut state = self.state.lock().await;
        state.status = Status::Inactive;

        let should_clear = match remaining {
            LifespanRemaining::Expired => true,
            LifespanRemaining::Remaining(d) => d < Duration::from_millis(LIFESPAN_SAFETY_BUFFER_MS),
            LifespanRemaining::Unbounded => false,
        };
        if should_clear {
            state.start_time = None;
            state.lifespan_ms = 0;
        }
    }
}
