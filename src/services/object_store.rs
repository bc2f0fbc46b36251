//! Bucket and object persistence.
//!
//! `ObjectStore` is the data-access seam the gateway depends on; the SQLite
//! implementation keeps the folder forest in a single `objects` table where
//! folders are rows carrying the folder content type.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite, types::Json};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    bucket::Bucket,
    object::{FOLDER_CONTENT_TYPE, NewObject, Object},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} is not empty")]
    NotEmpty(String),
    #[error("invalid parent folder: {0}")]
    InvalidParent(String),
    #[error("record has already been completed")]
    AlreadyCompleted,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Listing and sibling-lookup filter. `parent_folder_id = None` selects the
/// bucket root.
///
/// When both `owner_id` and `app_id` are set a row matches either of them.
#[derive(Clone, Debug, Default)]
pub struct ObjectFilter {
    pub owner_id: Option<String>,
    pub app_id: Option<String>,
    pub parent_folder_id: Option<Uuid>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub object_count: i64,
    pub bytes: i64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ObjectStats {
    pub buckets: i64,
    pub objects: i64,
    pub folders: i64,
    pub total_bytes: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_bucket(&self, name: &str, public: bool) -> StoreResult<Bucket>;
    async fn get_bucket(&self, name: &str) -> StoreResult<Bucket>;
    async fn list_buckets(&self) -> StoreResult<Vec<Bucket>>;
    /// Fails with `NotEmpty` while the bucket still holds objects.
    async fn delete_bucket(&self, name: &str) -> StoreResult<()>;

    /// Inserts an object. A set parent must be a folder in the same bucket.
    async fn create_object(&self, object: NewObject) -> StoreResult<Object>;
    async fn get_object(&self, id: Uuid) -> StoreResult<Object>;
    /// Finds `name` among the siblings visible through `scope`.
    async fn get_object_by_path(
        &self,
        bucket_id: Uuid,
        scope: &ObjectFilter,
        name: &str,
    ) -> StoreResult<Object>;
    async fn list_objects(&self, bucket_id: Uuid, filter: &ObjectFilter)
    -> StoreResult<Vec<Object>>;
    async fn list_children(&self, folder_id: Uuid) -> StoreResult<Vec<Object>>;
    async fn list_bucket_objects(&self, bucket_id: Uuid) -> StoreResult<Vec<Object>>;
    async fn update_object_metadata(&self, id: Uuid, metadata: &Value) -> StoreResult<Object>;
    async fn rename_object(&self, id: Uuid, name: &str) -> StoreResult<Object>;
    /// Fails with `NotEmpty` for folders that still have children.
    async fn delete_object(&self, id: Uuid) -> StoreResult<()>;
    async fn touch_last_viewed(&self, id: Uuid) -> StoreResult<()>;

    async fn usage_for_user(&self, user_id: &str) -> StoreResult<Usage>;
    async fn stats(&self) -> StoreResult<ObjectStats>;
    async fn ping(&self) -> StoreResult<()>;
}

const OBJECT_COLUMNS: &str = "id, bucket_id, name, parent_folder_id, size, content_type, checksum, \
     metadata, user_id, app_id, storage_key, created_at, updated_at, last_viewed_at";

/// SQLite-backed object store.
#[derive(Clone)]
pub struct SqliteObjectStore {
    db: Arc<SqlitePool>,
}

impl SqliteObjectStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn fetch_object(&self, id: Uuid) -> StoreResult<Object> {
        sqlx::query_as::<_, Object>(&format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?"))
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::NotFound(format!("object `{}`", id)),
                other => StoreError::Database(other),
            })
    }

    /// Checks that `parent_id` names a folder inside `bucket_id`.
    async fn ensure_parent_folder(&self, bucket_id: Uuid, parent_id: Uuid) -> StoreResult<()> {
        let parent = match self.fetch_object(parent_id).await {
            Ok(parent) => parent,
            Err(StoreError::NotFound(_)) => {
                return Err(StoreError::InvalidParent(format!(
                    "folder `{}` does not exist",
                    parent_id
                )));
            }
            Err(err) => return Err(err),
        };
        if parent.bucket_id != bucket_id {
            return Err(StoreError::InvalidParent(format!(
                "folder `{}` belongs to another bucket",
                parent_id
            )));
        }
        if !parent.is_folder() {
            return Err(StoreError::InvalidParent(format!(
                "`{}` is not a folder",
                parent.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn create_bucket(&self, name: &str, public: bool) -> StoreResult<Bucket> {
        let now = Utc::now();
        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            public,
            created_at: now,
            updated_at: now,
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, public, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(bucket.public)
        .bind(bucket.created_at)
        .bind(bucket.updated_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::AlreadyExists(format!("bucket `{}`", name)))
            }
            Err(err) => Err(StoreError::Database(err)),
        }
    }

    async fn get_bucket(&self, name: &str) -> StoreResult<Bucket> {
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, public, created_at, updated_at FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(format!("bucket `{}`", name)),
            other => StoreError::Database(other),
        })
    }

    async fn list_buckets(&self) -> StoreResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, public, created_at, updated_at FROM buckets ORDER BY name ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(buckets)
    }

    async fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        let bucket = self.get_bucket(name).await?;
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket_id = ?")
            .bind(bucket.id)
            .fetch_one(&*self.db)
            .await?;
        if remaining > 0 {
            return Err(StoreError::NotEmpty(format!("bucket `{}`", name)));
        }

        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("bucket `{}`", name)));
        }
        Ok(())
    }

    async fn create_object(&self, object: NewObject) -> StoreResult<Object> {
        if let Some(parent_id) = object.parent_folder_id {
            self.ensure_parent_folder(object.bucket_id, parent_id).await?;
        }

        let now = Utc::now();
        let inserted = sqlx::query_as::<_, Object>(&format!(
            "INSERT INTO objects (
                id, bucket_id, name, parent_folder_id, size, content_type, checksum,
                metadata, user_id, app_id, storage_key, created_at, updated_at, last_viewed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(object.id)
        .bind(object.bucket_id)
        .bind(&object.name)
        .bind(object.parent_folder_id)
        .bind(object.size)
        .bind(&object.content_type)
        .bind(&object.checksum)
        .bind(Json(&object.metadata))
        .bind(&object.user_id)
        .bind(&object.app_id)
        .bind(&object.storage_key)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await;

        match inserted {
            Ok(obj) => Ok(obj),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::AlreadyExists(format!("object `{}`", object.name)))
            }
            Err(err) => Err(StoreError::Database(err)),
        }
    }

    async fn get_object(&self, id: Uuid) -> StoreResult<Object> {
        self.fetch_object(id).await
    }

    async fn get_object_by_path(
        &self,
        bucket_id: Uuid,
        scope: &ObjectFilter,
        name: &str,
    ) -> StoreResult<Object> {
        let mut builder = scoped_select(bucket_id, scope);
        builder.push(" AND name = ");
        builder.push_bind(name.to_string());
        builder.push(" LIMIT 1");

        builder
            .build_query_as::<Object>()
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("object `{}`", name)))
    }

    async fn list_objects(
        &self,
        bucket_id: Uuid,
        filter: &ObjectFilter,
    ) -> StoreResult<Vec<Object>> {
        let mut builder = scoped_select(bucket_id, filter);

        // Folders first, then files, each alphabetically.
        builder.push(" ORDER BY content_type <> ");
        builder.push_bind(FOLDER_CONTENT_TYPE);
        builder.push(", name ASC");

        let rows: Vec<Object> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    async fn list_children(&self, folder_id: Uuid) -> StoreResult<Vec<Object>> {
        let rows = sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE parent_folder_id = ? ORDER BY name ASC"
        ))
        .bind(folder_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn list_bucket_objects(&self, bucket_id: Uuid) -> StoreResult<Vec<Object>> {
        let rows = sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket_id = ? ORDER BY created_at ASC"
        ))
        .bind(bucket_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn update_object_metadata(&self, id: Uuid, metadata: &Value) -> StoreResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "UPDATE objects SET metadata = ?, updated_at = ? WHERE id = ?
             RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(Json(metadata))
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(format!("object `{}`", id)),
            other => StoreError::Database(other),
        })
    }

    async fn rename_object(&self, id: Uuid, name: &str) -> StoreResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "UPDATE objects SET name = ?, updated_at = ? WHERE id = ?
             RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(name)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(format!("object `{}`", id)),
            err if is_unique_violation(&err) => {
                StoreError::AlreadyExists(format!("object `{}`", name))
            }
            other => StoreError::Database(other),
        })
    }

    async fn delete_object(&self, id: Uuid) -> StoreResult<()> {
        let children: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE parent_folder_id = ?")
                .bind(id)
                .fetch_one(&*self.db)
                .await?;
        if children > 0 {
            return Err(StoreError::NotEmpty(format!("folder `{}`", id)));
        }

        let result = sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("object `{}`", id)));
        }
        Ok(())
    }

    async fn touch_last_viewed(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE objects SET last_viewed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("object `{}`", id)));
        }
        Ok(())
    }

    async fn usage_for_user(&self, user_id: &str) -> StoreResult<Usage> {
        let (object_count, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM objects
             WHERE user_id = ? AND content_type <> ?",
        )
        .bind(user_id)
        .bind(FOLDER_CONTENT_TYPE)
        .fetch_one(&*self.db)
        .await?;
        Ok(Usage {
            object_count,
            bytes,
        })
    }

    async fn stats(&self) -> StoreResult<ObjectStats> {
        let buckets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buckets")
            .fetch_one(&*self.db)
            .await?;
        let (objects, folders, total_bytes): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                COALESCE(SUM(CASE WHEN content_type <> ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN content_type = ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(size), 0)
             FROM objects",
        )
        .bind(FOLDER_CONTENT_TYPE)
        .bind(FOLDER_CONTENT_TYPE)
        .fetch_one(&*self.db)
        .await?;
        Ok(ObjectStats {
            buckets,
            objects,
            folders,
            total_bytes,
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// `SELECT` over one directory level of a bucket, narrowed by owner scope.
fn scoped_select(bucket_id: Uuid, filter: &ObjectFilter) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket_id = "
    ));
    builder.push_bind(bucket_id);
    builder.push(" AND parent_folder_id IS ");
    builder.push_bind(filter.parent_folder_id);

    match (&filter.owner_id, &filter.app_id) {
        (Some(owner), Some(app)) => {
            builder.push(" AND (user_id = ");
            builder.push_bind(owner.clone());
            builder.push(" OR app_id = ");
            builder.push_bind(app.clone());
            builder.push(")");
        }
        (Some(owner), None) => {
            builder.push(" AND user_id = ");
            builder.push_bind(owner.clone());
        }
        (None, Some(app)) => {
            builder.push(" AND app_id = ");
            builder.push_bind(app.clone());
        }
        (None, None) => {}
    }
    builder
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
