//! Stage execution as apalis jobs, for durable queue backends.

use std::sync::Arc;

use apalis::prelude::{Attempt, Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::application::repos::RepoError;

use super::consumer::{Disposition, StageRunner};
use super::queue::{Delivery, PipelineQueue};
use super::StageMessage;

const TARGET: &str = "papyrus::pipeline::worker";

/// Job payload stored by the durable backend. A scheduled retry is pushed
/// as a new job carrying the next attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub message: StageMessage,
    pub attempt: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl StageJob {
    pub fn new(message: StageMessage, attempt: u32) -> Self {
        Self {
            message,
            attempt,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    /// `fetches` is how many times the backend handed out this row, this
    /// one included. Fetches past the first are redeliveries of a run that
    /// never finished.
    pub fn delivery(&self, fetches: usize) -> Delivery {
        let redeliveries = u32::try_from(fetches.saturating_sub(1)).unwrap_or(u32::MAX);
        Delivery {
            message: self.message.clone(),
            attempts: self.attempt.saturating_add(redeliveries),
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Shared context of every stage worker.
#[derive(Clone)]
pub struct StageWorkerContext {
    pub runner: Arc<StageRunner>,
    pub queue: Arc<dyn PipelineQueue>,
}

fn job_failed(err: RepoError) -> ApalisError {
    let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}

/// Worker function registered for each stage's storage.
pub async fn process_stage_job(
    job: StageJob,
    context: Data<StageWorkerContext>,
    attempt: Attempt,
) -> Result<(), ApalisError> {
    let delivery = job.delivery(attempt.current());
    let delay = match context.runner.process(&delivery).await {
        Ok(Disposition::Ack) => return Ok(()),
        Ok(Disposition::RetryAfter(delay)) => delay,
        Err(err) => {
            // The outcome could not be recorded; run the stage again later.
            warn!(
                target = TARGET,
                stage = %delivery.message.stage,
                job_id = %delivery.message.job_id,
                attempt = delivery.attempts,
                error = %err,
                "job store unavailable, rescheduling"
            );
            context
                .runner
                .retry_policy()
                .backoff
                .delay_for(delivery.attempts)
        }
    };

    context
        .queue
        .enqueue_retry(delivery.message, delivery.attempts.saturating_add(1), delay)
        .await
        .map_err(job_failed)
}
