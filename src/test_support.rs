//! Shared fixtures for in-crate tests.

use bytes::Bytes;
use futures::stream;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    auth::CallerIdentity,
    db,
    models::{object::Object, token::DownloadToken},
    services::{
        blob_store::{ByteStream, DiskBlobStore},
        extensions::builtin_registry,
        gateway::{GatewaySettings, TransferGateway, UploadRequest},
        hooks::{DispatcherSettings, HookDispatcher, RegistryDispatcher, RequestSnapshot},
        object_store::SqliteObjectStore,
        provider::LocalTokenProvider,
        token_store::{SqliteTokenStore, TokenStore},
    },
};

/// Single-connection in-memory database with the schema applied.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    db::run_migrations(&pool).await.expect("apply migrations");
    Arc::new(pool)
}

/// File-backed database shared by several connections, for tests that race
/// writers against each other.
pub async fn shared_pool() -> Arc<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(scratch_dir().join("meta.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .expect("open file-backed sqlite");
    db::run_migrations(&pool).await.expect("apply migrations");
    Arc::new(pool)
}

/// Fresh, existing directory under the system temp dir.
pub fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("transfer-gateway-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

pub fn alice() -> CallerIdentity {
    CallerIdentity {
        user_id: "alice".into(),
        app_id: None,
        roles: vec!["admin".into()],
    }
}

pub fn bob() -> CallerIdentity {
    CallerIdentity {
        user_id: "bob".into(),
        app_id: None,
        roles: Vec::new(),
    }
}

pub fn byte_body(data: Vec<u8>) -> ByteStream<'static> {
    Box::pin(stream::iter(vec![Ok(Bytes::from(data))]))
}

pub fn chunked_body(chunks: Vec<Vec<u8>>) -> ByteStream<'static> {
    Box::pin(stream::iter(
        chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk))),
    ))
}

/// A gateway over SQLite in memory, a scratch disk store and the local provider.
pub struct TestHarness {
    pub gateway: TransferGateway,
    pub tokens: Arc<SqliteTokenStore>,
    pub hooks: Arc<RegistryDispatcher>,
    pub blob_dir: PathBuf,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::build(memory_pool().await, Duration::from_secs(900), None).await
    }

    pub async fn with_ttl(ttl: Duration) -> Self {
        Self::build(memory_pool().await, ttl, None).await
    }

    pub async fn with_quota(quota_bytes: i64) -> Self {
        Self::build(memory_pool().await, Duration::from_secs(900), Some(quota_bytes)).await
    }

    /// Gateway over a multi-connection database, for concurrent callers.
    pub async fn shared() -> Self {
        Self::build(shared_pool().await, Duration::from_secs(900), None).await
    }

    async fn build(pool: Arc<SqlitePool>, token_ttl: Duration, quota_bytes: Option<i64>) -> Self {
        let objects = Arc::new(SqliteObjectStore::new(pool.clone()));
        let tokens = Arc::new(SqliteTokenStore::new(pool));
        let blob_dir = scratch_dir();
        let blobs = Arc::new(DiskBlobStore::new(blob_dir.clone()));
        let provider = Arc::new(LocalTokenProvider::new(tokens.clone(), ""));
        let hooks = Arc::new(RegistryDispatcher::new(
            builtin_registry(objects.clone(), quota_bytes, true),
            DispatcherSettings {
                hook_timeout: Duration::from_secs(2),
                workers: 2,
                queue_capacity: 64,
            },
        ));

        let gateway = TransferGateway::new(
            objects,
            tokens.clone(),
            blobs,
            provider,
            hooks.clone(),
            GatewaySettings {
                token_ttl,
                max_upload_size: 1024 * 1024,
                internal_bucket: "int_storage".into(),
                quota_bytes,
            },
        );
        gateway
            .ensure_internal_bucket()
            .await
            .expect("internal bucket");

        Self {
            gateway,
            tokens,
            hooks,
            blob_dir,
        }
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            method: "POST".into(),
            path: "/storage/test".into(),
            headers: Vec::new(),
            client_ip: Some("127.0.0.1".into()),
        }
    }

    pub async fn upload(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        name: &str,
        data: &[u8],
    ) -> Object {
        self.upload_into(caller, bucket, None, name, data).await
    }

    pub async fn upload_into(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        parent_folder_id: Option<Uuid>,
        name: &str,
        data: &[u8],
    ) -> Object {
        self.gateway
            .upload_stream(
                caller,
                &self.snapshot(),
                UploadRequest {
                    bucket: bucket.into(),
                    parent_folder_id,
                    name: name.into(),
                    content_type: "application/octet-stream".into(),
                    declared_size: Some(data.len() as i64),
                    metadata: None,
                },
                byte_body(data.to_vec()),
            )
            .await
            .expect("upload")
    }

    /// Regular files currently held by the disk store.
    pub fn payload_files(&self) -> usize {
        fn walk(dir: &std::path::Path) -> usize {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() { walk(&path) } else { 1 }
                })
                .sum()
        }
        walk(&self.blob_dir)
    }

    /// Poll until the download token has been finalized.
    pub async fn wait_for_download(&self, token: &str) -> DownloadToken {
        for _ in 0..200 {
            let current = self
                .tokens
                .get_download_token_by_token(token)
                .await
                .expect("download token");
            if current.completed {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download token was never finalized");
    }

    /// Poll until the after-hook workers have drained `count` jobs.
    pub async fn wait_for_hooks(&self, count: u64) {
        for _ in 0..200 {
            if self.hooks.stats().completed >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hook workers did not drain {} jobs", count);
    }
}
