//! # Worker Demo
//!
//! Shows `durajob-core` wired to the SQLite adapter directly: no event bus,
//! no command dispatch, just `Queue::create_job` + `add_worker` + `start`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use durajob_core::{CreateJobOptions, Handler, QueueError, WorkerOptions};
use durajob_sqlite::{open_queue, QueueConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

struct EmailWorker;

#[async_trait]
impl Handler for EmailWorker {
    async fn call(&self, id: &str, payload: serde_json::Value) -> Result<(), QueueError> {
        let job: SendEmail = serde_json::from_value(payload)
            .map_err(|e| QueueError::HandlerFailure { message: e.to_string() })?;
        tracing::info!(job_id = id, to = %job.to, subject = %job.subject, "sending email");
        Ok(())
    }
}

struct FlakyWorker;

#[async_trait]
impl Handler for FlakyWorker {
    async fn call(&self, id: &str, _payload: serde_json::Value) -> Result<(), QueueError> {
        tracing::info!(job_id = id, "flaky job ran, failing on purpose");
        Err(QueueError::HandlerFailure {
            message: "simulated transient failure".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = QueueConfig {
        store_path: PathBuf::from(":memory:"),
        ..QueueConfig::default()
    };
    let queue = open_queue(&config)?;

    queue.add_worker("email:send", Arc::new(EmailWorker), WorkerOptions {
        concurrency: 4,
        ..Default::default()
    })?;
    queue.add_worker("flaky:task", Arc::new(FlakyWorker), WorkerOptions::default())?;

    queue
        .create_job(
            Uuid::new_v4().to_string(),
            "email:send",
            SendEmail {
                to: "ops@example.com".to_string(),
                subject: "queue is alive".to_string(),
            },
            CreateJobOptions {
                priority: 10,
                ..Default::default()
            },
            false,
        )
        .await?;

    queue
        .create_job(
            Uuid::new_v4().to_string(),
            "flaky:task",
            serde_json::json!({}),
            CreateJobOptions {
                attempts: 3,
                retry_delay: 500,
                ..Default::default()
            },
            false,
        )
        .await?;

    // Run for up to 3 seconds or until the queue drains, whichever comes first.
    tokio::select! {
        _ = queue.start(3_000, None) => {}
        _ = tokio::time::sleep(std::time::Duration::from_secs(4)) => {}
    }

    let remaining = queue.get_jobs(true).await?;
    tracing::info!(remaining = remaining.len(), "demo run finished");

    queue.close().await?;
    Ok(())
}
