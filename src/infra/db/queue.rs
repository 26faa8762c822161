use std::num::NonZeroU32;
use std::time::Duration;

use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use async_trait::async_trait;
use sqlx::{PgPool, query_scalar};
use time::OffsetDateTime;
use tracing::debug;

use crate::application::pipeline::{PipelineQueue, Stage, StageJob, StageMessage};
use crate::application::repos::RepoError;

use super::map_sqlx_error;

const TARGET: &str = "papyrus::pipeline::queue";

/// Per-stage queues stored in the apalis job table. Each stage is one
/// apalis namespace, polled by that stage's workers.
#[derive(Clone)]
pub struct ApalisStageQueue {
    pool: PgPool,
    max_attempts: i32,
}

impl ApalisStageQueue {
    /// `max_attempts` bounds how often apalis hands out one row, including
    /// re-enqueues of rows orphaned by a crashed worker.
    pub fn new(pool: PgPool, max_attempts: NonZeroU32) -> Self {
        Self {
            pool,
            max_attempts: i32::try_from(max_attempts.get()).unwrap_or(i32::MAX),
        }
    }

    /// Create the apalis schema if it is missing.
    pub async fn setup(pool: &PgPool) -> Result<(), sqlx::Error> {
        PostgresStorage::<()>::setup(pool).await
    }

    /// Storage a stage's workers poll. A row held by a worker that stopped
    /// heartbeating is handed out again after `visibility`.
    pub fn storage(
        &self,
        stage: Stage,
        visibility: Duration,
        poll_interval: Duration,
    ) -> PostgresStorage<StageJob> {
        PostgresStorage::new_with_config(
            self.pool.clone(),
            ApalisSqlConfig::new(stage.queue_name())
                .set_poll_interval(poll_interval)
                .set_reenqueue_orphaned_after(visibility),
        )
    }

    async fn push(&self, job: StageJob, run_at: OffsetDateTime) -> Result<(), RepoError> {
        let stage = job.message.stage;
        let job_id = job.message.job_id;
        let attempt = job.attempt;
        let payload =
            serde_json::to_value(&job).map_err(|err| RepoError::from_persistence(err.to_string()))?;

        let id: String = query_scalar(
            "SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id",
        )
        .bind(stage.queue_name())
        .bind(payload)
        .bind("Pending")
        .bind(run_at)
        .bind(self.max_attempts)
        .bind(0_i32)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!(
            target = TARGET,
            stage = stage.as_str(),
            job_id = %job_id,
            attempt,
            task_id = %id,
            "stage job pushed"
        );
        Ok(())
    }
}

#[async_trait]
impl PipelineQueue for ApalisStageQueue {
    async fn enqueue(&self, message: StageMessage) -> Result<(), RepoError> {
        self.push(StageJob::new(message, 1), OffsetDateTime::now_utc())
            .await
    }

    async fn enqueue_retry(
        &self,
        message: StageMessage,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), RepoError> {
        let run_at = OffsetDateTime::now_utc() + delay;
        self.push(StageJob::new(message, attempt), run_at).await
    }

    async fn depth(&self, stage: Stage) -> Result<u64, RepoError> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM apalis.jobs WHERE job_type = $1 AND status IN ('Pending', 'Running')",
        )
        .bind(stage.queue_name())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        u64::try_from(count).map_err(|_| RepoError::from_persistence("count out of range"))
    }

    async fn purge_finished(&self, before: OffsetDateTime) -> Result<u64, RepoError> {
        let namespaces: Vec<&str> = Stage::ALL.iter().map(|stage| stage.queue_name()).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM apalis.jobs
             WHERE job_type = ANY($1)
               AND status IN ('Done', 'Failed', 'Killed')
               AND done_at < $2
            "#,
        )
        .bind(&namespaces)
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
