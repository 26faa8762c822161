use sqlx::{query, query_as};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{ApiKeysRepo, CreateApiKeyParams, RepoError};
use crate::domain::api_keys::{ApiKeyRecord, ApiKeyTier, Quota};

use super::{PostgresRepositories, map_sqlx_error};

const KEY_COLUMNS: &str = "id, name, key_hash, tier, quota, active, created_at, last_used_at";

#[derive(Debug, sqlx::FromRow)]
struct ApiKeyRow {
    id: Uuid,
    name: String,
    key_hash: String,
    tier: String,
    quota: i32,
    active: bool,
    created_at: OffsetDateTime,
    last_used_at: Option<OffsetDateTime>,
}

impl TryFrom<ApiKeyRow> for ApiKeyRecord {
    type Error = RepoError;

    fn try_from(row: ApiKeyRow) -> Result<Self, Self::Error> {
        let tier: ApiKeyTier = row.tier.parse().map_err(|()| {
            RepoError::from_persistence(format!("unknown api key tier `{}`", row.tier))
        })?;
        Ok(ApiKeyRecord {
            id: row.id,
            name: row.name,
            key_hash: row.key_hash,
            tier,
            quota: Quota::from_stored(row.quota),
            active: row.active,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[async_trait::async_trait]
impl ApiKeysRepo for PostgresRepositories {
    async fn create_key(&self, params: CreateApiKeyParams) -> Result<ApiKeyRecord, RepoError> {
        let sql = format!(
            "INSERT INTO api_keys (id, name, key_hash, tier, quota, active, created_at) \
             VALUES ($1, $2, $3, $4, $5, TRUE, $6) RETURNING {KEY_COLUMNS}"
        );
        let row: ApiKeyRow = query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&params.name)
            .bind(&params.key_hash)
            .bind(params.tier.as_str())
            .bind(params.quota.to_stored())
            .bind(OffsetDateTime::now_utc())
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.try_into()
    }

    async fn find_active_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, RepoError> {
        let sql = format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE key_hash = $1 AND active");
        let row: Option<ApiKeyRow> = query_as(&sql)
            .bind(key_hash)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.map(ApiKeyRecord::try_from).transpose()
    }

    async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, RepoError> {
        let sql = format!("SELECT {KEY_COLUMNS} FROM api_keys ORDER BY created_at DESC, id DESC");
        let rows: Vec<ApiKeyRow> = query_as(&sql)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(ApiKeyRecord::try_from).collect()
    }

    async fn deactivate_key(&self, id: Uuid) -> Result<bool, RepoError> {
        let result = query("UPDATE api_keys SET active = FALSE WHERE id = $1 AND active")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_last_used(&self, id: Uuid, at: OffsetDateTime) -> Result<(), RepoError> {
        query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
