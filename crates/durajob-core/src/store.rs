//! Persistence Adapter contract.
//!
//! The core never speaks SQL; it builds a [`JobQuery`] describing the
//! predicate/sort/limit it needs and drives it through whatever
//! [`PersistenceAdapter`] the host wired up via `begin_write`/`commit`.
//! `durajob-sqlite` is the production embedded-database implementation;
//! `durajob-testing` provides an in-memory one for fast scheduler unit
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::job::Job;

/// Sort direction for a single `JobQuery` sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// A single multi-key sort clause, e.g. `priority DESC, created ASC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Priority(SortDir),
    Created(SortDir),
}

/// ANDed predicate clauses over the `Job` columns.
///
/// All fields are optional; an absent field means "no constraint on that
/// column". The scheduler is the only caller that builds these, always
/// through [`JobQuery::eligible`].
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub active: Option<bool>,
    pub failed_is_null: Option<bool>,
    pub next_valid_time_before: Option<DateTime<Utc>>,
    pub name_eq: Option<String>,
    pub timeout_gt: Option<u64>,
    pub timeout_lt: Option<u64>,
    pub sort: Vec<SortKey>,
    pub limit: Option<i64>,
}

impl JobQuery {
    /// The base eligibility predicate: not currently claimed, not
    /// terminally failed, and due. The lifespan-mode timeout-fit clause is
    /// optionally ANDed in on top of this.
    pub fn eligible(now: DateTime<Utc>) -> Self {
        Self {
            active: Some(false),
            failed_is_null: Some(true),
            next_valid_time_before: Some(now),
            name_eq: None,
            timeout_gt: None,
            timeout_lt: None,
            sort: vec![SortKey::Priority(SortDir::Desc), SortKey::Created(SortDir::Asc)],
            limit: None,
        }
    }

    /// An unconstrained query, for `get_jobs`/`flush_queue`.
    pub fn all() -> Self {
        Self::default()
    }

    /// In lifespan mode, a job must have a nonzero timeout that fits
    /// inside the remaining lifespan with the 500ms shutdown buffer
    /// already subtracted by the caller.
    pub fn with_timeout_fits(mut self, timeout_upper_ms: u64) -> Self {
        self.timeout_gt = Some(0);
        self.timeout_lt = Some(timeout_upper_ms);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name_eq = Some(name.into());
        self
    }

    pub fn with_limit(mut self, limit: Option<i64>) -> Self {
        self.limit = limit;
        self
    }
}

/// One atomic unit of work against the store. All reads and writes issued
/// through the same `Transaction` must observe each other (read-your-writes)
/// so that the claim algorithm's "flip `active`, then re-query" sequence
/// never re-returns a row it just claimed. Dropping a `Transaction` without
/// calling `commit` rolls the writes back.
#[async_trait]
pub trait Transaction: Send {
    async fn query(&mut self, q: &JobQuery) -> Result<Vec<Job>, QueueError>;
    async fn insert(&mut self, job: &Job) -> Result<(), QueueError>;
    async fn update(&mut self, job: &Job) -> Result<(), QueueError>;
    async fn delete(&mut self, id: &str) -> Result<(), QueueError>;
    /// Delete every row matching `q` and return the number of rows removed.
    /// `q.sort`/`q.limit` are not meaningful for a bulk delete (order and
    /// "first N" are ambiguous once every match is removed); implementations
    /// must reject such a query with `QueueError::InvalidArgument` rather
    /// than silently dropping those fields.
    async fn delete_many(&mut self, q: &JobQuery) -> Result<u64, QueueError>;
    /// Commit the transaction, making its writes visible to subsequent
    /// `begin_write` callers.
    async fn commit(self: Box<Self>) -> Result<(), QueueError>;
}

/// Abstracts the transactional store.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Open a new write transaction. The returned `Transaction` borrows the
    /// adapter's single shared handle per process.
    async fn begin_write(&self) -> Result<Box<dyn Transaction + '_>, QueueError>;

    /// Closes the underlying store handle.
    async fn close(&self) -> Result<(), QueueError>;
}
