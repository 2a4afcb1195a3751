//! durajob-core: a durable, priority-ordered, at-least-once job queue
//! scheduler meant to run embedded inside a host application process.
//!
//! ```text
//!                 +----------------------+
//!  create_job --> |        Queue         | <-- start/stop (run loop)
//!                 |  (scheduler.rs)      |
//!                 +----------+-----------+
//!                            |
//!                  claims via JobQuery
//!                            |
//!                 +----------v-----------+        +-------------------+
//!                 |  PersistenceAdapter   |<------>| durajob-sqlite /   |
//!                 |  (store.rs trait)     |        | durajob-testing    |
//!                 +-----------------------+        +-------------------+
//!
//!                 +-----------------------+
//!                 |   WorkerRegistry      | <-- add_worker/remove_worker
//!                 |   (registry.rs)       |
//!                 +-----------------------+
//! ```
//!
//! The core crate owns the `Job` row shape, the persistence contract, the
//! worker registry, and the scheduler. It never touches SQL directly —
//! `durajob-sqlite` is the production embedded-database adapter; see that
//! crate's docs for schema and migration details.

mod error;
mod job;
mod registry;
mod scheduler;
mod store;

pub use error::QueueError;
pub use job::{CreateJobOptions, Job, JobData, DEFAULT_ATTEMPTS, DEFAULT_TIMEOUT_MS};
pub use registry::{FnHandler, Handler, WorkerOptions, WorkerRegistry};
pub use scheduler::{LifespanRemaining, Queue, LIFESPAN_SAFETY_BUFFER_MS};
pub use store::{JobQuery, PersistenceAdapter, SortDir, SortKey, Transaction};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

    /// A trivial in-process `PersistenceAdapter` used only by these unit
    /// tests; `durajob-testing` provides the reusable version for
    /// downstream consumers.
    #[derive(Default)]
    struct MemoryAdapter {
        rows: AsyncMutex<Vec<Job>>,
    }

    /// Holds the mutex guard for its whole lifetime, matching
    /// `durajob-sqlite`'s `SqliteTx`: a second `begin_write` call blocks
    /// until this one commits or drops, so concurrent transactions can
    /// never clobber each other's writes. Dropping without `commit`
    /// restores the pre-transaction snapshot.
    struct MemoryTx<'a> {
        guard: MutexGuard<'a, Vec<Job>>,
        before: Vec<Job>,
        committed: bool,
    }

    impl<'a> MemoryTx<'a> {
        fn begin(guard: MutexGuard<'a, Vec<Job>>) -> Self {
            let before = guard.clone();
            Self {
                guard,
                before,
                committed: false,
            }
        }
    }

    impl<'a> Drop for MemoryTx<'a> {
        fn drop(&mut self) {
            if !self.committed {
                *self.guard = std::mem::take(&mut self.before);
            }
        }
    }

    #[async_trait]
    impl<'a> Transaction for MemoryTx<'a> {
        async fn query(&mut self, q: &JobQuery) -> Result<Vec<Job>, QueueError> {
            let mut out: Vec<Job> = self
                .guard
                .iter()
                .filter(|j| q.active.map_or(true, |a| j.active == a))
                .filter(|j| q.failed_is_null.map_or(true, |fin| j.failed.is_none() == fin))
                .filter(|j| {
                    q.next_valid_time_before
                        .map_or(true, |t| j.next_valid_time <= t)
                })
                .filter(|j| q.name_eq.as_ref().map_or(true, |n| &j.name == n))
                .filter(|j| q.timeout_gt.map_or(true, |t| j.timeout > t))
                .filter(|j| q.timeout_lt.map_or(true, |t| j.timeout < t))
                .cloned()
                .collect();

            for key in q.sort.iter().rev() {
                match key {
                    SortKey::Priority(SortDir::Desc) => out.sort_by(|a, b| b.priority.cmp(&a.priority)),
                    SortKey::Priority(SortDir::Asc) => out.sort_by(|a, b| a.priority.cmp(&b.priority)),
                    SortKey::Created(SortDir::Asc) => out.sort_by(|a, b| a.created.cmp(&b.created)),
                    SortKey::Created(SortDir::Desc) => out.sort_by(|a, b| b.created.cmp(&a.created)),
                }
            }
            if let Some(limit) = q.limit {
                out.truncate(limit.max(0) as usize);
            }
            Ok(out)
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
            let matched = self.query(q).await?;
            let ids: Vec<String> = matched.iter().map(|j| j.id.clone()).collect();
            self.guard.retain(|j| !ids.contains(&j.id));
            Ok(ids.len() as u64)
        }

        async fn commit(mut self: Box<Self>) -> Result<(), QueueError> {
            self.committed = true;
            Ok(())
        }
    }

    #[async_trait]
    impl PersistenceAdapter for MemoryAdapter {
        async fn begin_write(&self) -> Result<Box<dyn Transaction + '_>, QueueError> {
            let guard = self.rows.lock().await;
            Ok(Box::new(MemoryTx::begin(guard)))
        }

        async fn close(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn queue() -> Arc<Queue> {
        Queue::new(Arc::new(MemoryAdapter::default()))
    }

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn call(&self, _id: &str, _payload: serde_json::Value) -> Result<(), QueueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(QueueError::HandlerFailure {
                    message: "boom".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn create_job_rejects_empty_name() {
        let q = queue();
        let err = q
            .create_job("id-1", "", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn priority_then_creation_order_selects_first() {
        let q = queue();
        q.create_job(
            "low",
            "work",
            json!({}),
            CreateJobOptions {
                priority: 0,
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        q.create_job(
            "high",
            "work",
            json!({}),
            CreateJobOptions {
                priority: 10,
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();

        let batch = q
            .get_concurrent_jobs(None, LifespanRemaining::Unbounded)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "high");
        assert_eq!(batch[1].id, "low");
    }

    #[tokio::test]
    async fn concurrency_limits_batch_to_worker_setting() {
        let q = queue();
        for i in 0..5 {
            q.create_job(format!("j{i}"), "work", json!({}), CreateJobOptions::default(), false)
                .await
                .unwrap();
        }
        let calls = Arc::new(AtomicU32::new(0));
        q.add_worker(
            "work",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail: false,
            }),
            WorkerOptions {
                concurrency: 2,
                ..Default::default()
            },
        )
        .unwrap();

        let batch = q
            .get_concurrent_jobs(None, LifespanRemaining::Unbounded)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn process_job_with_no_worker_records_no_worker_failure() {
        let q = queue();
        let job = q
            .create_job(
                "orphan",
                "ghost-task",
                json!({}),
                CreateJobOptions {
                    attempts: 1,
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        q.process_job(job).await.unwrap();

        let rows = q.get_jobs(true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].failed.is_some());
        let data = rows[0].decode_data().unwrap();
        assert_eq!(data.failed_attempts, Some(1));
        assert!(data.errors.unwrap()[0].contains("ghost-task"));
    }

    #[tokio::test]
    async fn successful_job_is_deleted() {
        let q = queue();
        let calls = Arc::new(AtomicU32::new(0));
        q.add_worker(
            "ok-task",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail: false,
            }),
            WorkerOptions::default(),
        )
        .unwrap();
        let job = q
            .create_job("j1", "ok-task", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap();

        q.process_job(job).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(q.get_jobs(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_schedules_next_valid_time_in_the_future() {
        let q = queue();
        q.add_worker(
            "flaky",
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicU32::new(0)),
                fail: true,
            }),
            WorkerOptions::default(),
        )
        .unwrap();
        let job = q
            .create_job(
                "j1",
                "flaky",
                json!({}),
                CreateJobOptions {
                    attempts: 3,
                    retry_delay: 1000,
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        let created_next_valid = job.next_valid_time;

        q.process_job(job).await.unwrap();

        let rows = q.get_jobs(true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].failed.is_none());
        assert!(rows[0].next_valid_time > created_next_valid);
        assert!(!rows[0].active);
    }

    #[tokio::test]
    async fn terminal_failure_after_exhausting_attempts() {
        let q = queue();
        q.add_worker(
            "flaky",
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicU32::new(0)),
                fail: true,
            }),
            WorkerOptions::default(),
        )
        .unwrap();
        let job = q
            .create_job(
                "j1",
                "flaky",
                json!({}),
                CreateJobOptions {
                    attempts: 1,
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        q.process_job(job).await.unwrap();

        let rows = q.get_jobs(true).await.unwrap();
        assert!(rows[0].failed.is_some());
        assert!(rows[0].is_failed_consistent());
    }

    #[tokio::test]
    async fn lifespan_expired_returns_no_jobs() {
        let q = queue();
        q.create_job("j1", "work", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap();
        let batch = q
            .get_concurrent_jobs(None, LifespanRemaining::Expired)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn zero_timeout_job_is_excluded_from_lifespan_mode_claims() {
        let q = queue();
        q.create_job(
            "j1",
            "work",
            json!({}),
            CreateJobOptions {
                timeout: 0,
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();

        let batch = q
            .get_concurrent_jobs(
                None,
                LifespanRemaining::Remaining(std::time::Duration::from_secs(10)),
            )
            .await
            .unwrap();
        assert!(batch.is_empty(), "zero-timeout jobs must not match the lifespan timeout-fit clause");
    }

    #[tokio::test]
    async fn flush_job_removes_only_the_named_row() {
        let q = queue();
        q.create_job("keep", "work", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap();
        q.create_job("drop", "work", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap();

        q.flush_job("drop").await.unwrap();

        let rows = q.get_jobs(true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "keep");
    }

    #[tokio::test]
    async fn flush_queue_by_name_leaves_other_names_intact() {
        let q = queue();
        q.create_job("a", "alpha", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap();
        q.create_job("b", "beta", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap();

        q.flush_queue(Some("alpha")).await.unwrap();

        let rows = q.get_jobs(true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "beta");
    }

    struct SlowHandler;

    #[async_trait]
    impl Handler for SlowHandler {
        async fn call(&self, _id: &str, _payload: serde_json::Value) -> Result<(), QueueError> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_second_call_is_a_no_op() {
        let q = queue();
        q.add_worker("slow", Arc::new(SlowHandler), WorkerOptions::default())
            .unwrap();
        q.create_job("j1", "slow", json!({}), CreateJobOptions::default(), false)
            .await
            .unwrap();

        let first = {
            let q = q.clone();
            tokio::spawn(async move { q.start(0, Some(1)).await })
        };
        // Let the spawned loop run until it parks on the slow handler's
        // timer; the paused clock never advances on its own, so this
        // doesn't consume any (virtual or real) time.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let second = q.start(0, Some(1)).await;
        assert!(!second);

        tokio::time::advance(std::time::Duration::from_millis(200)).await;
        assert!(first.await.unwrap());
    }

    #[tokio::test]
    async fn run_loop_processes_up_to_max_jobs_then_stops() {
        let q = queue();
        let calls = Arc::new(AtomicU32::new(0));
        q.add_worker(
            "work",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail: false,
            }),
            WorkerOptions::default(),
        )
        .unwrap();
        for i in 0..5 {
            q.create_job(format!("j{i}"), "work", json!({}), CreateJobOptions::default(), false)
                .await
                .unwrap();
        }

        q.start(0, Some(3)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(q.get_jobs(true).await.unwrap().len(), 2);
    }
}
