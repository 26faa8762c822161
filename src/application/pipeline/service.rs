use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::idempotency::{Claim, IdempotencyCache, IdempotencyError, IdempotencyKey};
use crate::application::repos::{JobStatusRepo, RepoError, TransitionParams};
use crate::domain::documents::{DocumentRequest, DocumentType};
use crate::domain::jobs::{JobRecord, JobStage, StageMetadata};

use super::queue::PipelineQueue;
use super::StageMessage;

const TARGET: &str = "papyrus::pipeline::service";
const PENDING_JOB_WAIT: Duration = Duration::from_secs(2);
const PENDING_JOB_POLL: Duration = Duration::from_millis(25);
const MAX_CLAIM_ROUNDS: usize = 3;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("idempotency store unavailable")]
    Idempotency(#[source] IdempotencyError),
    #[error("job store unavailable")]
    Jobs(#[source] RepoError),
    #[error("job could not be enqueued")]
    Enqueue(#[source] RepoError),
    #[error("job payload could not be encoded: {0}")]
    Encode(String),
    #[error("idempotency key is contended")]
    Contended,
}

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("job not found")]
    NotFound,
    #[error("job is `{0}`, result not available")]
    NotReady(JobStage),
    #[error("job failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub job_id: Uuid,
    /// The idempotency token was already bound; no new job was created.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: Uuid,
    pub url: String,
}

/// Front door of the pipeline: creates jobs and answers status queries.
#[derive(Clone)]
pub struct PipelineService {
    jobs: Arc<dyn JobStatusRepo>,
    queue: Arc<dyn PipelineQueue>,
    idempotency: IdempotencyCache,
}

impl PipelineService {
    pub fn new(
        jobs: Arc<dyn JobStatusRepo>,
        queue: Arc<dyn PipelineQueue>,
        idempotency: IdempotencyCache,
    ) -> Self {
        Self {
            jobs,
            queue,
            idempotency,
        }
    }

    /// Accept a validated request. With a token, a live binding replays the
    /// earlier job id instead of creating a second job.
    pub async fn submit(
        &self,
        request: DocumentRequest,
        token: Option<IdempotencyKey>,
    ) -> Result<Submission, SubmitError> {
        let job_id = Uuid::new_v4();
        let document_type = request.document_type;

        if let Some(key) = token.as_ref()
            && let Some(existing) = self.claim(key, job_id).await?
        {
            return Ok(self.replay(existing, document_type));
        }

        let now = OffsetDateTime::now_utc();
        if let Err(err) = self.create_and_enqueue(job_id, &request, now).await {
            if let Some(key) = token.as_ref()
                && let Err(release_err) = self.idempotency.release(key, job_id).await
            {
                warn!(
                    target = TARGET,
                    job_id = %job_id,
                    error = %release_err,
                    "failed to release idempotency token"
                );
            }
            return Err(err);
        }

        counter!("papyrus_jobs_submitted_total", "type" => document_type.as_str()).increment(1);
        info!(
            target = TARGET,
            job_id = %job_id,
            document_type = document_type.as_str(),
            "job accepted"
        );
        Ok(Submission {
            job_id,
            replayed: false,
        })
    }

    /// Bind `key` to `job_id`, or return the job another request bound it
    /// to. A binding whose job is never created is released by its owner;
    /// the claim is then attempted again.
    async fn claim(
        &self,
        key: &IdempotencyKey,
        job_id: Uuid,
    ) -> Result<Option<Uuid>, SubmitError> {
        for _ in 0..MAX_CLAIM_ROUNDS {
            let now = OffsetDateTime::now_utc();
            let bound = match self
                .idempotency
                .lookup(key, now)
                .await
                .map_err(SubmitError::Idempotency)?
            {
                Some(existing) => existing,
                None => match self
                    .idempotency
                    .store(key, job_id, now)
                    .await
                    .map_err(SubmitError::Idempotency)?
                {
                    Claim::Claimed => return Ok(None),
                    Claim::Existing(existing) => existing,
                },
            };
            if self.await_bound_job(key, bound).await? {
                return Ok(Some(bound));
            }
            debug!(target = TARGET, job_id = %bound, "idempotency binding released, claiming again");
        }
        Err(SubmitError::Contended)
    }

    /// Wait for the request holding `key` to create `job_id`. Returns false
    /// when the binding was released instead. A holder slower than
    /// the wait bound is trusted to finish.
    async fn await_bound_job(
        &self,
        key: &IdempotencyKey,
        job_id: Uuid,
    ) -> Result<bool, SubmitError> {
        let deadline = Instant::now() + PENDING_JOB_WAIT;
        loop {
            if self
                .jobs
                .find_job(job_id)
                .await
                .map_err(SubmitError::Jobs)?
                .is_some()
            {
                return Ok(true);
            }
            let still_bound = self
                .idempotency
                .lookup(key, OffsetDateTime::now_utc())
                .await
                .map_err(SubmitError::Idempotency)?;
            if still_bound != Some(job_id) {
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Ok(true);
            }
            sleep(PENDING_JOB_POLL).await;
        }
    }

    fn replay(&self, job_id: Uuid, document_type: DocumentType) -> Submission {
        counter!("papyrus_idempotent_replay_total", "type" => document_type.as_str()).increment(1);
        info!(target = TARGET, job_id = %job_id, "idempotent replay");
        Submission {
            job_id,
            replayed: true,
        }
    }

    async fn create_and_enqueue(
        &self,
        job_id: Uuid,
        request: &DocumentRequest,
        now: OffsetDateTime,
    ) -> Result<(), SubmitError> {
        let message = StageMessage::generate(job_id, request)
            .map_err(|err| SubmitError::Encode(err.to_string()))?;
        self.jobs
            .create_job(job_id, now)
            .await
            .map_err(SubmitError::Jobs)?;

        if let Err(err) = self.queue.enqueue(message).await {
            let params = TransitionParams::new(job_id, JobStage::Failed, OffsetDateTime::now_utc())
                .with_metadata(StageMetadata::failure("job could not be enqueued"));
            if let Err(mark_err) = self.jobs.transition_job(params).await {
                warn!(
                    target = TARGET,
                    job_id = %job_id,
                    error = %mark_err,
                    "failed to mark unenqueued job"
                );
            }
            return Err(SubmitError::Enqueue(err));
        }
        Ok(())
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobRecord, ResultError> {
        self.jobs
            .find_job(job_id)
            .await?
            .ok_or(ResultError::NotFound)
    }

    /// Retrieval URL of a completed job.
    pub async fn result(&self, job_id: Uuid) -> Result<JobResult, ResultError> {
        let record = self.status(job_id).await?;
        match (record.stage, record.result_url) {
            (JobStage::Completed, Some(url)) => Ok(JobResult { job_id, url }),
            (JobStage::Failed, _) => Err(ResultError::Failed(
                record.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            (stage, _) => Err(ResultError::NotReady(stage)),
        }
    }
}
