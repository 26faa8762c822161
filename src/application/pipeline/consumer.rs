use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::application::pool::PoolError;
use crate::application::render::RenderError;
use crate::application::repos::{JobStatusRepo, RepoError, TransitionParams};
use crate::application::storage::StorageError;
use crate::domain::jobs::{JobStage, StageMetadata};

use super::queue::{Delivery, ReservingQueue};
use super::retry::RetryPolicy;
use super::Stage;

const TARGET: &str = "papyrus::pipeline::consumer";

/// Failure of a single stage attempt.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// May succeed on a later delivery.
    #[error("{0}")]
    Transient(String),
    /// Will fail again; the job is marked failed without retrying.
    #[error("{0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Permanent(message) => message,
        }
    }
}

impl From<RenderError> for StageError {
    fn from(err: RenderError) -> Self {
        if err.is_permanent() {
            Self::Permanent(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

impl From<StorageError> for StageError {
    fn from(err: StorageError) -> Self {
        if err.is_permanent() {
            Self::Permanent(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

impl From<RepoError> for StageError {
    fn from(err: RepoError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

impl From<PoolError> for StageError {
    fn from(err: PoolError) -> Self {
        Self::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and wrote its status.
    Completed,
    /// Nothing to do: the job is gone, finished, or already past this stage.
    Skipped,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError>;
}

/// What the queue should do with a delivery once its stage ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message: it succeeded, failed for good, or was dead-lettered.
    Ack,
    /// Deliver the message again after the delay.
    RetryAfter(Duration),
}

/// Runs one stage handler under a retry policy, independent of the queue
/// that delivered the message.
///
/// Transient failures are retried with backoff until the attempt budget is
/// spent, after which the job is marked failed. Deliveries beyond the budget
/// are dead-lettered without running the handler.
pub struct StageRunner {
    handler: Arc<dyn StageHandler>,
    jobs: Arc<dyn JobStatusRepo>,
    retry: RetryPolicy,
}

impl StageRunner {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        jobs: Arc<dyn JobStatusRepo>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            handler,
            jobs,
            retry,
        }
    }

    pub fn stage(&self) -> Stage {
        self.handler.stage()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Process one delivery. An error means the failure could not be
    /// recorded; the message must then be delivered again.
    pub async fn process(&self, delivery: &Delivery) -> Result<Disposition, RepoError> {
        let stage = self.stage();
        let job_id = delivery.message.job_id;
        let policy = self.retry;

        if policy.is_dead_letter(delivery.attempts) {
            let reason = format!(
                "exceeded {} delivery attempts",
                policy.max_attempts.get()
            );
            warn!(
                target = TARGET,
                stage = stage.as_str(),
                job_id = %job_id,
                attempts = delivery.attempts,
                "dead-lettering message"
            );
            counter!("papyrus_stage_failed_total", "stage" => stage.as_str(), "reason" => "dead_letter")
                .increment(1);
            self.mark_failed(delivery, &reason).await?;
            return Ok(Disposition::Ack);
        }

        let waited = OffsetDateTime::now_utc() - delivery.enqueued_at;
        histogram!("papyrus_queue_wait_ms", "stage" => stage.as_str())
            .record(waited.whole_milliseconds().max(0) as f64);

        let started = Instant::now();
        let result = self.handler.handle(delivery).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let outcome = match &result {
            Ok(StageOutcome::Completed) => "completed",
            Ok(StageOutcome::Skipped) => "skipped",
            Err(StageError::Transient(_)) => "transient",
            Err(StageError::Permanent(_)) => "permanent",
        };
        histogram!("papyrus_stage_duration_ms", "stage" => stage.as_str(), "outcome" => outcome)
            .record(elapsed_ms);

        match result {
            Ok(outcome) => {
                debug!(
                    target = TARGET,
                    stage = stage.as_str(),
                    job_id = %job_id,
                    ?outcome,
                    elapsed_ms,
                    "stage finished"
                );
                Ok(Disposition::Ack)
            }
            Err(err) if err.is_transient() && policy.should_retry(delivery.attempts) => {
                let delay = policy.backoff.delay_for(delivery.attempts);
                warn!(
                    target = TARGET,
                    stage = stage.as_str(),
                    job_id = %job_id,
                    attempt = delivery.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "stage failed, retrying"
                );
                Ok(Disposition::RetryAfter(delay))
            }
            Err(err) => {
                error!(
                    target = TARGET,
                    stage = stage.as_str(),
                    job_id = %job_id,
                    attempt = delivery.attempts,
                    error = %err,
                    "stage failed permanently"
                );
                let reason = if err.is_transient() { "exhausted" } else { "permanent" };
                counter!("papyrus_stage_failed_total", "stage" => stage.as_str(), "reason" => reason)
                    .increment(1);
                self.mark_failed(delivery, err.message()).await?;
                Ok(Disposition::Ack)
            }
        }
    }

    /// Record the failure on the job. A job that is already terminal or
    /// gone needs no update.
    async fn mark_failed(&self, delivery: &Delivery, message: &str) -> Result<(), RepoError> {
        let params = TransitionParams::new(
            delivery.message.job_id,
            JobStage::Failed,
            OffsetDateTime::now_utc(),
        )
        .with_metadata(StageMetadata::failure(message));
        match self.jobs.transition_job(params).await {
            Ok(_) | Err(RepoError::Conflict { .. }) | Err(RepoError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub concurrency: NonZeroUsize,
    /// How long a reserved message stays hidden from other consumers.
    pub visibility: Duration,
    /// Upper bound on idle waiting between queue polls.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

/// Drives one stage off a [`ReservingQueue`] with a fixed number of polling
/// loops. Used with the in-process queue; durable deployments run stages as
/// apalis workers instead.
#[derive(Clone)]
pub struct RetryingConsumer {
    runner: Arc<StageRunner>,
    queue: Arc<dyn ReservingQueue>,
    settings: ConsumerSettings,
}

impl RetryingConsumer {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        queue: Arc<dyn ReservingQueue>,
        jobs: Arc<dyn JobStatusRepo>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            runner: Arc::new(StageRunner::new(handler, jobs, settings.retry)),
            queue,
            settings,
        }
    }

    pub fn stage(&self) -> Stage {
        self.runner.stage()
    }

    /// Run `concurrency` polling loops until `shutdown` flips to `true`.
    /// A message already being processed is finished before its loop exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let stage = self.stage();
        info!(
            target = TARGET,
            stage = stage.as_str(),
            concurrency = self.settings.concurrency.get(),
            "stage consumer started"
        );
        let loops = (0..self.settings.concurrency.get()).map(|slot| {
            let consumer = self.clone();
            let shutdown = shutdown.clone();
            async move { consumer.poll_loop(slot, shutdown).await }
        });
        join_all(loops).await;
        info!(target = TARGET, stage = stage.as_str(), "stage consumer stopped");
    }

    async fn poll_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let stage = self.stage();
        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(true) => false,
                Ok(false) => true,
                Err(err) => {
                    warn!(
                        target = TARGET,
                        stage = stage.as_str(),
                        slot,
                        error = %err,
                        "queue unavailable"
                    );
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = self.queue.wait_for_work(stage, self.settings.poll_interval) => {}
                }
            }
        }
    }

    /// Reserve and process at most one message. Returns whether a message
    /// was found.
    ///
    /// When the job store is unavailable the message stays reserved and is
    /// redelivered once its visibility timeout lapses.
    pub async fn run_once(&self) -> Result<bool, RepoError> {
        let stage = self.stage();
        let Some(reservation) = self.queue.reserve(stage, self.settings.visibility).await? else {
            return Ok(false);
        };
        match self.runner.process(&reservation.delivery).await? {
            Disposition::Ack => self.queue.ack(reservation.id).await?,
            Disposition::RetryAfter(delay) => {
                self.queue.retry_later(reservation.id, delay).await?
            }
        }
        Ok(true)
    }
}
