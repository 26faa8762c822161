//! Quota windows and idempotency records.

use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{
    IdempotencyRecord, IdempotencyRepo, InsertOutcome, QuotaRepo, RepoError,
};

use super::util::count_to_u32;
use super::{PostgresRepositories, map_sqlx_error};

/// An expired record can be deleted between our failed insert and the
/// follow-up read; the insert is retried this many times.
const CLAIM_ATTEMPTS: usize = 3;

#[async_trait]
impl QuotaRepo for PostgresRepositories {
    async fn increment_window(
        &self,
        key: &str,
        window_start: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<u32, RepoError> {
        let count: i32 = query_scalar(
            r#"
            INSERT INTO quota_windows (key, window_start, count, expires_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (key, window_start)
            DO UPDATE SET count = quota_windows.count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(window_start)
        .bind(expires_at)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        count_to_u32(count)
    }

    async fn purge_windows(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let result = query("DELETE FROM quota_windows WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    job_id: Uuid,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        Self {
            key: row.key,
            job_id: row.job_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

#[async_trait]
impl IdempotencyRepo for PostgresRepositories {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<InsertOutcome, RepoError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let inserted: Option<Uuid> = query_scalar(
                r#"
                INSERT INTO idempotency_records (key, job_id, created_at, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (key) DO UPDATE
                SET job_id = EXCLUDED.job_id,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_records.expires_at <= EXCLUDED.created_at
                RETURNING job_id
                "#,
            )
            .bind(&record.key)
            .bind(record.job_id)
            .bind(record.created_at)
            .bind(record.expires_at)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

            if inserted.is_some() {
                return Ok(InsertOutcome::Inserted);
            }

            let existing: Option<IdempotencyRow> = query_as(
                "SELECT key, job_id, created_at, expires_at FROM idempotency_records WHERE key = $1",
            )
            .bind(&record.key)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
            if let Some(existing) = existing {
                return Ok(InsertOutcome::Existing(existing.into()));
            }
        }
        Err(RepoError::conflict(format!(
            "idempotency key `{}` kept changing",
            record.key
        )))
    }

    async fn find_live(
        &self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<Option<IdempotencyRecord>, RepoError> {
        let row: Option<IdempotencyRow> = query_as(
            "SELECT key, job_id, created_at, expires_at FROM idempotency_records \
             WHERE key = $1 AND expires_at > $2",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn release(&self, key: &str, job_id: Uuid) -> Result<(), RepoError> {
        query("DELETE FROM idempotency_records WHERE key = $1 AND job_id = $2")
            .bind(key)
            .bind(job_id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let result = query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
