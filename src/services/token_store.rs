//! Upload and download token persistence.
//!
//! Completion is a conditional update (`WHERE completed = 0`) so two finalize
//! calls racing on the same token cannot both win, even across processes
//! sharing one database.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    models::token::{DownloadToken, NewDownloadToken, NewUploadToken, UploadToken},
    services::object_store::{StoreError, StoreResult},
};

/// Random bytes behind every external token handle.
const TOKEN_BYTES: usize = 32;

#[derive(Clone, Debug, Default, Serialize)]
pub struct TokenStats {
    pub upload_tokens_pending: i64,
    pub upload_tokens_completed: i64,
    pub download_tokens_pending: i64,
    pub download_tokens_completed: i64,
    pub bytes_uploaded: i64,
    pub bytes_served: i64,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn create_upload_token(
        &self,
        token: NewUploadToken,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<UploadToken>;
    async fn get_upload_token_by_token(&self, token: &str) -> StoreResult<UploadToken>;
    async fn mark_upload_progress(&self, id: Uuid, bytes: i64) -> StoreResult<()>;
    /// Succeeds for exactly one caller per token; later calls get `AlreadyCompleted`.
    async fn complete_upload_token(
        &self,
        id: Uuid,
        object_id: Uuid,
        bytes: i64,
    ) -> StoreResult<UploadToken>;

    async fn create_download_token(
        &self,
        token: NewDownloadToken,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<DownloadToken>;
    async fn get_download_token_by_token(&self, token: &str) -> StoreResult<DownloadToken>;
    async fn mark_download_progress(&self, id: Uuid, bytes: i64) -> StoreResult<()>;
    /// Reserve the single streamed read. Later claims get `AlreadyCompleted`.
    async fn claim_download_token(&self, id: Uuid) -> StoreResult<()>;
    /// Succeeds for exactly one caller per token; later calls get `AlreadyCompleted`.
    async fn complete_download_token(&self, id: Uuid, bytes: i64) -> StoreResult<DownloadToken>;

    async fn delete_expired_upload_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64>;
    async fn delete_expired_download_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64>;
    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<TokenStats>;
}

/// Generate an unguessable, URL-safe token handle.
pub fn generate_token() -> String {
    let mut raw = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

const UPLOAD_COLUMNS: &str = "id, token, bucket, parent_folder_id, object_name, storage_key, \
     user_id, app_id, max_size, content_type, bytes_uploaded, completed, object_id, \
     expires_at, created_at, client_ip";

const DOWNLOAD_COLUMNS: &str = "id, token, object_id, bucket, object_name, user_id, file_size, \
     bytes_served, started, completed, expires_at, created_at, client_ip";

/// SQLite-backed token store.
#[derive(Clone)]
pub struct SqliteTokenStore {
    db: Arc<SqlitePool>,
}

impl SqliteTokenStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Distinguish a lost completion race from a missing row.
    async fn completion_conflict(&self, table: &str, id: Uuid) -> StoreError {
        let exists = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {table} WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await;
        match exists {
            Ok(0) => StoreError::NotFound(format!("token `{}`", id)),
            Ok(_) => StoreError::AlreadyCompleted,
            Err(err) => StoreError::Database(err),
        }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn create_upload_token(
        &self,
        token: NewUploadToken,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<UploadToken> {
        let row = sqlx::query_as::<_, UploadToken>(&format!(
            "INSERT INTO upload_tokens (
                id, token, bucket, parent_folder_id, object_name, storage_key, user_id, app_id,
                max_size, content_type, bytes_uploaded, completed, object_id, expires_at,
                created_at, client_ip
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, NULL, ?, ?, ?)
            RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(generate_token())
        .bind(&token.bucket)
        .bind(token.parent_folder_id)
        .bind(&token.object_name)
        .bind(&token.storage_key)
        .bind(&token.user_id)
        .bind(&token.app_id)
        .bind(token.max_size)
        .bind(&token.content_type)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(&token.client_ip)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn get_upload_token_by_token(&self, token: &str) -> StoreResult<UploadToken> {
        sqlx::query_as::<_, UploadToken>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM upload_tokens WHERE token = ?"
        ))
        .bind(token)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("upload token".into()),
            other => StoreError::Database(other),
        })
    }

    async fn mark_upload_progress(&self, id: Uuid, bytes: i64) -> StoreResult<()> {
        sqlx::query("UPDATE upload_tokens SET bytes_uploaded = ? WHERE id = ? AND completed = 0")
            .bind(bytes)
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn complete_upload_token(
        &self,
        id: Uuid,
        object_id: Uuid,
        bytes: i64,
    ) -> StoreResult<UploadToken> {
        let row = sqlx::query_as::<_, UploadToken>(&format!(
            "UPDATE upload_tokens SET completed = 1, object_id = ?, bytes_uploaded = ?
             WHERE id = ? AND completed = 0
             RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(object_id)
        .bind(bytes)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(token) => Ok(token),
            None => Err(self.completion_conflict("upload_tokens", id).await),
        }
    }

    async fn create_download_token(
        &self,
        token: NewDownloadToken,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<DownloadToken> {
        let row = sqlx::query_as::<_, DownloadToken>(&format!(
            "INSERT INTO download_tokens (
                id, token, object_id, bucket, object_name, user_id, file_size, bytes_served,
                started, completed, expires_at, created_at, client_ip
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?, ?)
            RETURNING {DOWNLOAD_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(generate_token())
        .bind(token.object_id)
        .bind(&token.bucket)
        .bind(&token.object_name)
        .bind(&token.user_id)
        .bind(token.file_size)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(&token.client_ip)
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn get_download_token_by_token(&self, token: &str) -> StoreResult<DownloadToken> {
        sqlx::query_as::<_, DownloadToken>(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM download_tokens WHERE token = ?"
        ))
        .bind(token)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("download token".into()),
            other => StoreError::Database(other),
        })
    }

    async fn mark_download_progress(&self, id: Uuid, bytes: i64) -> StoreResult<()> {
        sqlx::query("UPDATE download_tokens SET bytes_served = ? WHERE id = ? AND completed = 0")
            .bind(bytes)
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn claim_download_token(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE download_tokens SET started = 1
             WHERE id = ? AND started = 0 AND completed = 0",
        )
        .bind(id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.completion_conflict("download_tokens", id).await);
        }
        Ok(())
    }

    async fn complete_download_token(&self, id: Uuid, bytes: i64) -> StoreResult<DownloadToken> {
        let row = sqlx::query_as::<_, DownloadToken>(&format!(
            "UPDATE download_tokens SET completed = 1, bytes_served = ?
             WHERE id = ? AND completed = 0
             RETURNING {DOWNLOAD_COLUMNS}"
        ))
        .bind(bytes)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(token) => Ok(token),
            None => Err(self.completion_conflict("download_tokens", id).await),
        }
    }

    async fn delete_expired_upload_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM upload_tokens WHERE expires_at < ?")
            .bind(now)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_download_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM download_tokens WHERE expires_at < ?")
            .bind(now)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<TokenStats> {
        let (upload_pending, upload_completed, bytes_uploaded): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                COALESCE(SUM(CASE WHEN completed = 0 AND expires_at >= ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN completed = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(bytes_uploaded), 0)
             FROM upload_tokens",
        )
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        let (download_pending, download_completed, bytes_served): (i64, i64, i64) =
            sqlx::query_as(
                "SELECT
                    COALESCE(SUM(CASE WHEN completed = 0 AND expires_at >= ? THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN completed = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(bytes_served), 0)
                 FROM download_tokens",
            )
            .bind(now)
            .fetch_one(&*self.db)
            .await?;

        Ok(TokenStats {
            upload_tokens_pending: upload_pending,
            upload_tokens_completed: upload_completed,
            download_tokens_pending: download_pending,
            download_tokens_completed: download_completed,
            bytes_uploaded,
            bytes_served,
        })
    }
}
