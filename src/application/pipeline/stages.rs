use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::pool::{ResourceManager, ResourcePool};
use crate::application::render::{DocumentRenderer, RenderContext};
use crate::application::repos::{JobStatusRepo, RepoError, TransitionParams};
use crate::application::storage::{ArtifactRef, ObjectStore};
use crate::domain::documents::DocumentRequest;
use crate::domain::jobs::StageMetadata;

use super::consumer::{StageError, StageHandler, StageOutcome};
use super::queue::{Delivery, PipelineQueue};
use super::{ArtifactPayload, Stage, StageMessage};

const TARGET: &str = "papyrus::pipeline::stages";

/// Storage filename for a job's rendered document.
pub fn artifact_filename(title: &str, job_id: Uuid) -> String {
    let slug = slug::slugify(title);
    let stem = if slug.is_empty() { "document" } else { slug.as_str() };
    format!("{stem}-{job_id}.pdf")
}

fn decode<T: DeserializeOwned>(delivery: &Delivery) -> Result<T, StageError> {
    serde_json::from_value(delivery.message.payload.clone()).map_err(|err| {
        StageError::permanent(format!(
            "malformed {} payload: {err}",
            delivery.message.stage
        ))
    })
}

enum Begin {
    Run,
    Skip,
}

/// Status bookkeeping shared by every stage.
#[derive(Clone)]
struct StageFlow {
    stage: Stage,
    jobs: Arc<dyn JobStatusRepo>,
    queue: Arc<dyn PipelineQueue>,
}

impl StageFlow {
    /// Move the job into this stage's in-progress state, or decide there is
    /// nothing to do.
    async fn begin(&self, job_id: Uuid) -> Result<Begin, StageError> {
        let stage = self.stage;
        let Some(record) = self.jobs.find_job(job_id).await? else {
            warn!(target = TARGET, stage = stage.as_str(), job_id = %job_id, "job not found, dropping message");
            return Ok(Begin::Skip);
        };

        if record.stage.is_terminal() {
            debug!(target = TARGET, stage = stage.as_str(), job_id = %job_id, status = record.stage.as_str(), "job already terminal");
            return Ok(Begin::Skip);
        }

        if record.stage == stage.done() {
            // Status was written but the hand-off may not have been.
            if let (Some(next), Some(key)) = (stage.next(), record.artifact_key.as_deref()) {
                self.queue
                    .enqueue(StageMessage::artifact(job_id, next, key))
                    .await?;
                info!(target = TARGET, stage = stage.as_str(), job_id = %job_id, "re-enqueued next stage");
            }
            return Ok(Begin::Skip);
        }

        if record.stage.has_reached(stage.done()) {
            return Ok(Begin::Skip);
        }

        let expected = if record.stage == stage.in_progress() {
            stage.in_progress()
        } else if record.stage == stage.entry() {
            stage.entry()
        } else {
            return Err(StageError::transient(format!(
                "job {job_id} is `{}`, not ready for {stage}",
                record.stage
            )));
        };

        let params = TransitionParams::new(job_id, stage.in_progress(), OffsetDateTime::now_utc())
            .expecting(expected);
        match self.jobs.transition_job(params).await {
            Ok(_) => Ok(Begin::Run),
            Err(RepoError::Conflict { message }) => {
                debug!(target = TARGET, stage = stage.as_str(), job_id = %job_id, %message, "lost race entering stage");
                Ok(Begin::Skip)
            }
            Err(RepoError::NotFound) => Ok(Begin::Skip),
            Err(err) => Err(err.into()),
        }
    }

    /// Write the stage's done status, then hand the job to the next stage.
    async fn finish(
        &self,
        job_id: Uuid,
        metadata: StageMetadata,
        next: Option<StageMessage>,
    ) -> Result<StageOutcome, StageError> {
        let stage = self.stage;
        let params = TransitionParams::new(job_id, stage.done(), OffsetDateTime::now_utc())
            .expecting(stage.in_progress())
            .with_metadata(metadata);
        match self.jobs.transition_job(params).await {
            Ok(_) => {}
            Err(RepoError::Conflict { message }) => {
                warn!(target = TARGET, stage = stage.as_str(), job_id = %job_id, %message, "status moved underneath stage");
                return Ok(StageOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(message) = next {
            self.queue.enqueue(message).await?;
        }
        Ok(StageOutcome::Completed)
    }
}

/// Renders the document inside a pooled context and stores the PDF.
pub struct GenerateStage<M>
where
    M: ResourceManager<Resource = RenderContext>,
{
    flow: StageFlow,
    pool: ResourcePool<M>,
    renderer: Arc<dyn DocumentRenderer>,
    store: Arc<dyn ObjectStore>,
    acquire_timeout: Duration,
}

impl<M> GenerateStage<M>
where
    M: ResourceManager<Resource = RenderContext>,
{
    pub fn new(
        jobs: Arc<dyn JobStatusRepo>,
        queue: Arc<dyn PipelineQueue>,
        pool: ResourcePool<M>,
        renderer: Arc<dyn DocumentRenderer>,
        store: Arc<dyn ObjectStore>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            flow: StageFlow {
                stage: Stage::Generate,
                jobs,
                queue,
            },
            pool,
            renderer,
            store,
            acquire_timeout,
        }
    }
}

#[async_trait]
impl<M> StageHandler for GenerateStage<M>
where
    M: ResourceManager<Resource = RenderContext>,
{
    fn stage(&self) -> Stage {
        Stage::Generate
    }

    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError> {
        let job_id = delivery.message.job_id;
        if let Begin::Skip = self.flow.begin(job_id).await? {
            return Ok(StageOutcome::Skipped);
        }
        let request: DocumentRequest = decode(delivery)?;

        let mut lease = self.pool.acquire_timeout(self.acquire_timeout).await?;
        let rendered = self.renderer.render(&mut lease, &request).await;
        let bytes = match rendered {
            Ok(bytes) => {
                lease.record_render();
                debug!(target = TARGET, job_id = %job_id, context_renders = lease.renders(), "render finished");
                lease.release().await;
                bytes
            }
            Err(err) if err.is_permanent() => {
                lease.release().await;
                return Err(err.into());
            }
            Err(err) => {
                lease.discard().await;
                return Err(err.into());
            }
        };

        let filename = artifact_filename(&request.title, job_id);
        let artifact = self.store.put(&filename, bytes).await?;
        debug!(target = TARGET, job_id = %job_id, key = artifact.key(), "document rendered");

        self.flow
            .finish(
                job_id,
                StageMetadata::artifact(artifact.key()),
                Some(StageMessage::artifact(job_id, Stage::Sign, artifact.key())),
            )
            .await
    }
}

/// Copies the rendered artifact to its signed location.
pub struct SignStage {
    flow: StageFlow,
    store: Arc<dyn ObjectStore>,
}

impl SignStage {
    pub fn new(
        jobs: Arc<dyn JobStatusRepo>,
        queue: Arc<dyn PipelineQueue>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            flow: StageFlow {
                stage: Stage::Sign,
                jobs,
                queue,
            },
            store,
        }
    }
}

#[async_trait]
impl StageHandler for SignStage {
    fn stage(&self) -> Stage {
        Stage::Sign
    }

    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError> {
        let job_id = delivery.message.job_id;
        if let Begin::Skip = self.flow.begin(job_id).await? {
            return Ok(StageOutcome::Skipped);
        }
        let payload: ArtifactPayload = decode(delivery)?;

        let signed = self
            .store
            .copy(&ArtifactRef::new(payload.artifact_key))
            .await?;

        self.flow
            .finish(
                job_id,
                StageMetadata::artifact(signed.key()),
                Some(StageMessage::artifact(job_id, Stage::Deliver, signed.key())),
            )
            .await
    }
}

/// Publishes a time-limited retrieval URL and completes the job.
pub struct DeliverStage {
    flow: StageFlow,
    store: Arc<dyn ObjectStore>,
    url_ttl: Duration,
}

impl DeliverStage {
    pub fn new(
        jobs: Arc<dyn JobStatusRepo>,
        queue: Arc<dyn PipelineQueue>,
        store: Arc<dyn ObjectStore>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            flow: StageFlow {
                stage: Stage::Deliver,
                jobs,
                queue,
            },
            store,
            url_ttl,
        }
    }
}

#[async_trait]
impl StageHandler for DeliverStage {
    fn stage(&self) -> Stage {
        Stage::Deliver
    }

    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError> {
        let job_id = delivery.message.job_id;
        if let Begin::Skip = self.flow.begin(job_id).await? {
            return Ok(StageOutcome::Skipped);
        }
        let payload: ArtifactPayload = decode(delivery)?;

        let url = self
            .store
            .signed_url(
                &ArtifactRef::new(payload.artifact_key),
                self.url_ttl,
                OffsetDateTime::now_utc(),
            )
            .await?;
        info!(target = TARGET, job_id = %job_id, "job delivered");

        self.flow
            .finish(job_id, StageMetadata::delivered(url), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Mutex;

    use bytes::Bytes;
    use serde_json::json;
    use tempfile::TempDir;
    use url::Url;

    use super::*;
    use crate::application::render::RenderError;
    use crate::domain::jobs::{JobRecord, JobStage};
    use crate::infra::memory::{MemoryQueue, MemoryRepositories};
    use crate::infra::render::WorkspaceManager;
    use crate::infra::storage::FilesystemObjectStore;

    /// Job store that remembers every stage written to it.
    #[derive(Default)]
    struct RecordingJobs {
        inner: MemoryRepositories,
        written: Mutex<Vec<JobStage>>,
    }

    #[async_trait]
    impl JobStatusRepo for RecordingJobs {
        async fn create_job(&self, id: Uuid, at: OffsetDateTime) -> Result<JobRecord, RepoError> {
            self.inner.create_job(id, at).await
        }

        async fn transition_job(&self, params: TransitionParams) -> Result<JobRecord, RepoError> {
            self.written.lock().expect("written lock").push(params.to);
            self.inner.transition_job(params).await
        }

        async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError> {
            self.inner.find_job(id).await
        }

        async fn purge_terminal_jobs(&self, before: OffsetDateTime) -> Result<u64, RepoError> {
            self.inner.purge_terminal_jobs(before).await
        }
    }

    struct UnreachableRenderer;

    #[async_trait]
    impl DocumentRenderer for UnreachableRenderer {
        async fn render(
            &self,
            _context: &mut RenderContext,
            _request: &DocumentRequest,
        ) -> Result<Bytes, RenderError> {
            panic!("malformed payloads must not reach the renderer");
        }

        async fn check(&self) -> Result<String, RenderError> {
            Ok("unreachable".to_string())
        }
    }

    #[tokio::test]
    async fn malformed_generate_payload_enters_stage_before_failing() {
        let dir = TempDir::new().expect("tempdir");
        let jobs = Arc::new(RecordingJobs::default());
        let job_id = Uuid::new_v4();
        jobs.create_job(job_id, OffsetDateTime::now_utc())
            .await
            .expect("create job");
        let store = FilesystemObjectStore::new(
            dir.path().join("artifacts"),
            Url::parse("http://files.test/").expect("url"),
            2,
            "stage-secret",
        )
        .expect("store");
        let stage = GenerateStage::new(
            jobs.clone(),
            Arc::new(MemoryQueue::new()),
            ResourcePool::new(
                WorkspaceManager::new(dir.path().join("workspaces")),
                NonZeroUsize::MIN,
            ),
            Arc::new(UnreachableRenderer),
            Arc::new(store),
            Duration::from_secs(1),
        );

        let delivery = Delivery {
            message: StageMessage {
                job_id,
                stage: Stage::Generate,
                payload: json!({ "unexpected": true }),
            },
            attempts: 1,
            enqueued_at: OffsetDateTime::now_utc(),
        };
        let err = stage.handle(&delivery).await.expect_err("malformed payload");

        assert!(!err.is_transient());
        assert!(err.to_string().contains("malformed generate payload"));
        assert_eq!(
            *jobs.written.lock().expect("written lock"),
            vec![JobStage::Generating]
        );
    }

    #[test]
    fn filename_uses_title_slug() {
        let id = Uuid::nil();
        assert_eq!(
            artifact_filename("Relatório Mensal 2024", id),
            format!("relatorio-mensal-2024-{id}.pdf")
        );
    }

    #[test]
    fn filename_falls_back_for_symbol_titles() {
        let id = Uuid::nil();
        assert_eq!(artifact_filename("!!!", id), format!("document-{id}.pdf"));
    }
}
