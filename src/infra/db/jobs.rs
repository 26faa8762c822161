use async_trait::async_trait;
use sqlx::{query, query_as};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{JobStatusRepo, RepoError, TransitionParams};
use crate::domain::error::DomainError;
use crate::domain::jobs::{JobRecord, JobStage};

use super::{PostgresRepositories, map_sqlx_error};

const JOB_COLUMNS: &str = "id, stage, artifact_key, result_url, error, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    stage: String,
    artifact_key: Option<String>,
    result_url: Option<String>,
    error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: row.id,
            stage: JobStage::try_from(row.stage.as_str()).map_err(RepoError::from_persistence)?,
            artifact_key: row.artifact_key,
            result_url: row.result_url,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl JobStatusRepo for PostgresRepositories {
    async fn create_job(&self, id: Uuid, at: OffsetDateTime) -> Result<JobRecord, RepoError> {
        let sql = format!(
            "INSERT INTO pdf_jobs (id, stage, created_at, updated_at) \
             VALUES ($1, $2, $3, $3) RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = query_as(&sql)
            .bind(id)
            .bind(JobStage::Queued.as_str())
            .bind(at)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.try_into()
    }

    /// The stage guard lives in the `WHERE` clause so concurrent writers
    /// cannot both move the same job.
    async fn transition_job(&self, params: TransitionParams) -> Result<JobRecord, RepoError> {
        let sources: Vec<String> = match params.expected {
            Some(expected) => {
                DomainError::check_transition(expected, params.to)?;
                vec![expected.as_str().to_string()]
            }
            None => JobStage::allowed_sources(params.to)
                .into_iter()
                .map(|stage| stage.as_str().to_string())
                .collect(),
        };

        let sql = format!(
            "UPDATE pdf_jobs SET stage = $2, \
                 artifact_key = COALESCE($3, artifact_key), \
                 result_url = COALESCE($4, result_url), \
                 error = COALESCE($5, error), \
                 updated_at = $6 \
             WHERE id = $1 AND stage = ANY($7) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = query_as(&sql)
            .bind(params.id)
            .bind(params.to.as_str())
            .bind(params.metadata.artifact_key)
            .bind(params.metadata.result_url)
            .bind(params.metadata.error)
            .bind(params.at)
            .bind(&sources)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => row.try_into(),
            None => match self.find_job(params.id).await? {
                Some(current) => Err(RepoError::conflict(format!(
                    "job {} is `{}`, cannot move to `{}`",
                    params.id, current.stage, params.to
                ))),
                None => Err(RepoError::NotFound),
            },
        }
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM pdf_jobs WHERE id = $1");
        let row: Option<JobRow> = query_as(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn purge_terminal_jobs(&self, before: OffsetDateTime) -> Result<u64, RepoError> {
        let result = query(
            "DELETE FROM pdf_jobs WHERE stage IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(before)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
