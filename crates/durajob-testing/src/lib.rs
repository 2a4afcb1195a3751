//! In-memory `PersistenceAdapter` and job fixture builder for exercising
//! `durajob-core` consumers without an embedded database on disk.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use durajob_core::{CreateJobOptions, Job, JobData, JobQuery, PersistenceAdapter, QueueError, SortDir, SortKey, Transaction};
use tokio::sync::{Mutex, MutexGuard};

/// An unshared, in-memory `PersistenceAdapter`. Mirrors `durajob-sqlite`'s
/// single-shared-handle model with a `Vec<Job>` in place of a connection, so
/// scheduler tests run without touching disk.
#[derive(Default)]
pub struct InMemoryAdapter {
    rows: Mutex<Vec<Job>>,
}

impl InMemoryAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed rows directly, bypassing `create_job` — useful for asserting
    /// against a known starting state.
    pub async fn seed(&self, jobs: impl IntoIterator<Item = Job>) {
        self.rows.lock().await.extend(jobs);
    }

    pub async fn snapshot(&self) -> Vec<Job> {
        self.rows.lock().await.clone()
    }
}

/// Holds the mutex guard for its whole lifetime, mirroring `durajob-sqlite`'s
/// `SqliteTx`: a second `begin_write` call blocks until this one commits or
/// drops, so two concurrent transactions can never clobber each other's
/// writes. Dropping without `commit` restores the pre-transaction snapshot.
struct InMemoryTx<'a> {
    guard: MutexGuard<'a, Vec<Job>>,
    before: Vec<Job>,
    committed: bool,
}

impl<'a> InMemoryTx<'a> {
    fn begin(guard: MutexGuard<'a, Vec<Job>>) -> Self {
        let before = guard.clone();
        Self {
            guard,
            before,
            committed: false,
        }
    }
}

impl<'a> Drop for InMemoryTx<'a> {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = std::mem::take(&mut self.before);
        }
    }
}

fn matches(job: &Job, q: &JobQuery) -> bool {
    q.active.map_or(true, |a| job.active == a)
        && q.failed_is_null.map_or(true, |fin| job.failed.is_none() == fin)
        && q.next_valid_time_before.map_or(true, |t| job.next_valid_time <= t)
        && q.name_eq.as_ref().map_or(true, |n| &job.name == n)
        && q.timeout_gt.map_or(true, |t| job.timeout > t)
        && q.timeout_lt.map_or(true, |t| job.timeout < t)
}

fn apply_sort_and_limit(mut rows: Vec<Job>, q: &JobQuery) -> Vec<Job> {
    for key in q.sort.iter().rev() {
        match key {
            SortKey::Priority(SortDir::Desc) => rows.sort_by(|a, b| b.priority.cmp(&a.priority)),
            SortKey::Priority(SortDir::Asc) => rows.sort_by(|a, b| a.priority.cmp(&b.priority)),
            SortKey::Created(SortDir::Asc) => rows.sort_by(|a, b| a.created.cmp(&b.created)),
            SortKey::Created(SortDir::Desc) => rows.sort_by(|a, b| b.created.cmp(&a.created)),
        }
    }
    if let Some(limit) = q.limit {
        rows.truncate(limit.max(0) as usize);
    }
    rows
}

#[async_trait]
impl<'a> Transaction for InMemoryTx<'a> {
    async fn query(&mut self, q: &JobQuery) -> Result<Vec<Job>, QueueError> {
        let matched: Vec<Job> = self.guard.iter().filter(|j| matches(j, q)).cloned().collect();
        Ok(apply_sort_and_limit(matched, q))
    }

    async fn insert(&mut self, job: &Job) -> Result<(), QueueError> {
        self.guard.push(job.clone());
        Ok(())
    }

    async fn update(&mut self, job: &Job) -> Result<(), QueueError> {
        if let Some(slot) = self.guard.iter_mut().find(|j| j.id == job.id) {
            *slot = job.clone();
        }
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<(), QueueError> {
        self.guard.retain(|j| j.id != id);
        Ok(())
    }

    async fn delete_many(&mut self, q: &JobQuery) -> Result<u64, QueueError> {
        if !q.sort.is_empty() || q.limit.is_some() {
            return Err(QueueError::InvalidArgument(
                "delete_many does not support sort or limit".into(),
            ));
        }
        let before = self.guard.len();
        self.guard.retain(|j| !matches(j, q));
        Ok((before - self.guard.len()) as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), QueueError> {
        self.committed = true;
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryAdapter {
    async fn begin_write(&self) -> Result<Box<dyn Transaction + '_>, QueueError> {
        let guard = self.rows.lock().await;
        Ok(Box::new(InMemoryTx::begin(guard)))
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Builds a [`Job`] row directly, without going through `Queue::create_job`.
/// Handy for seeding an adapter with jobs in specific states (already
/// `active`, already `failed`, scheduled in the future) that a running
/// queue would never hand back to a caller mid-construction.
pub struct JobFixture {
    id: String,
    name: String,
    payload: serde_json::Value,
    options: CreateJobOptions,
}

impl JobFixture {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("fixture-{:x}", fastrand::u64(..)),
            name: name.into(),
            payload: serde_json::json!({}),
            options: CreateJobOptions::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn timeout(mut self, ms: u64) -> Self {
        self.options.timeout = ms;
        self
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.options.attempts = n;
        self
    }

    pub fn retry_delay(mut self, ms: u64) -> Self {
        self.options.retry_delay = ms;
        self
    }

    /// Materialize a fresh, eligible-now `Job` row.
    pub fn build(self) -> Job {
        let now = Utc::now();
        Job {
            id: self.id,
            name: self.name,
            payload: self.payload.to_string(),
            data: serde_json::to_string(&JobData::new(self.options.attempts)).unwrap(),
            priority: self.options.priority,
            active: false,
            timeout: self.options.timeout,
            created: now,
            failed: None,
            next_valid_time: now,
            retry_delay: self.options.retry_delay,
        }
    }

    /// Materialize the row already marked `active` (as if claimed by a
    /// scheduler but not yet processed).
    pub fn build_active(self) -> Job {
        let mut job = self.build();
        job.active = true;
        job
    }

    /// Materialize the row already terminally failed, with one recorded
    /// error message.
    pub fn build_failed(self, message: impl Into<String>) -> Job {
        let mut job = self.build();
        let mut data = JobData::new(1);
        data.record_failure(message.into());
        job.set_data(&data).expect("JobData always serializes");
        job.failed = Some(Utc::now());
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_active_job_is_not_claimed_again() {
        let adapter = InMemoryAdapter::new();
        adapter
            .seed([JobFixture::new("work").build_active()])
            .await;

        let mut tx = adapter.begin_write().await.unwrap();
        let eligible = tx.query(&JobQuery::eligible(Utc::now())).await.unwrap();
        tx.commit().await.unwrap();

        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn fixture_builder_produces_consistent_failed_row() {
        let job = JobFixture::new("work").attempts(1).build_failed("boom");
        assert!(job.failed.is_some());
        assert!(job.is_failed_consistent());
    }
}
