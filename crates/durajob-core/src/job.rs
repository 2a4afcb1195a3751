//! The `Job` row and its companion `data` bookkeeping payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Default timeout (ms) applied when `create_job` is not given one.
pub const DEFAULT_TIMEOUT_MS: u64 = 25_000;
/// Default attempts applied when `create_job` is not given one.
pub const DEFAULT_ATTEMPTS: u32 = 1;

/// A persisted unit of deferred work.
///
/// `data` and `payload` are stored as JSON text, matching the embedded-
/// database schema in `durajob-sqlite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: String,
    pub data: String,
    pub priority: i64,
    pub active: bool,
    pub timeout: u64,
    pub created: DateTime<Utc>,
    pub failed: Option<DateTime<Utc>>,
    pub next_valid_time: DateTime<Utc>,
    pub retry_delay: u64,
}

impl Job {
    /// Decode `payload` into `T`. Opaque to the core; only handlers call this.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, QueueError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| QueueError::store_failure(anyhow::anyhow!("payload decode: {e}")))
    }

    /// Decode the `data` bookkeeping record.
    pub fn decode_data(&self) -> Result<JobData, QueueError> {
        serde_json::from_str(&self.data)
            .map_err(|e| QueueError::store_failure(anyhow::anyhow!("data decode: {e}")))
    }

    /// Re-encode and store a `JobData` record on this row.
    pub fn set_data(&mut self, data: &JobData) -> Result<(), QueueError> {
        self.data = serde_json::to_string(data)
            .map_err(|e| QueueError::store_failure(anyhow::anyhow!("data encode: {e}")))?;
        Ok(())
    }

    /// Invariant 3: `failedAttempts <= attempts` and `failed != null` iff
    /// `failedAttempts >= attempts`. Checked by tests, not enforced at
    /// runtime (it is an emergent property of `process_job`'s bookkeeping).
    pub fn is_failed_consistent(&self) -> bool {
        match self.decode_data() {
            Ok(data) => {
                let failed_attempts = data.failed_attempts.unwrap_or(0);
                let exhausted = failed_attempts >= data.attempts;
                failed_attempts <= data.attempts && (self.failed.is_some() == exhausted)
            }
            Err(_) => false,
        }
    }
}

/// The bookkeeping record stored (JSON-encoded) in `Job::data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobData {
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl JobData {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            failed_attempts: None,
            errors: None,
        }
    }

    /// Record a failed attempt, initializing `failed_attempts` to 1 if absent.
    pub fn record_failure(&mut self, message: String) {
        let next = self.failed_attempts.unwrap_or(0) + 1;
        self.failed_attempts = Some(next);
        self.errors.get_or_insert_with(Vec::new).push(message);
    }

    pub fn is_exhausted(&self) -> bool {
        self.failed_attempts.unwrap_or(0) >= self.attempts
    }
}

/// Options recognized by `create_job`.
#[derive(Debug, Clone)]
pub struct CreateJobOptions {
    pub priority: i64,
    pub timeout: u64,
    pub attempts: u32,
    pub retry_delay: u64,
}

impl Default for CreateJobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout: DEFAULT_TIMEOUT_MS,
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: 0,
        }
    }
}

// `timeout`/`attempts` are unsigned here, so the "must be non-negative"
// validation at the API boundary is enforced by the type system instead of
// a runtime check.
