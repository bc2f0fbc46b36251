//! Payload storage.
//!
//! Two backends sit behind [`BlobStore`]: a sharded local directory and an
//! S3-compatible bucket. Object metadata never lives here; callers address
//! payloads purely by storage key.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use md5::Context;
use s3::{Bucket, Region, creds::Credentials};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;
use uuid::Uuid;

use crate::config::RemoteStorageConfig;

pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'a>>;

const MAX_STORAGE_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("payload `{0}` not found")]
    NotFound(String),
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("remote storage: {0}")]
    Remote(String),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Size and checksum of a freshly written payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    pub size: i64,
    pub checksum: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Consume `stream` into `key`. Nothing is visible under `key` unless the
    /// whole stream was written.
    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        stream: ByteStream<'_>,
    ) -> BlobResult<StoredBlob>;

    async fn open(&self, key: &str) -> BlobResult<ByteStream<'static>>;

    /// Size and checksum of what is actually stored under `key`.
    async fn stat(&self, key: &str) -> BlobResult<StoredBlob>;

    /// Remove a payload. Missing keys are not an error.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Write, read back and remove a scratch payload.
    async fn probe(&self) -> BlobResult<()>;
}

/// Reject keys that could escape the storage root.
fn ensure_key_safe(key: &str) -> BlobResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_STORAGE_KEY_LEN
        || key.starts_with('/')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
    if invalid {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Payloads on local disk beneath `base_path/{shard}/{shard}/{key}`.
#[derive(Clone, Debug)]
pub struct DiskBlobStore {
    base_path: PathBuf,
}

impl DiskBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }


    /// Two-level shard from MD5(key), keeping directory fan-out bounded.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Remove empty directories from `start` upwards, never touching `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn put_stream(
        &self,
        key: &str,
        _content_type: &str,
        mut stream: ByteStream<'_>,
    ) -> BlobResult<StoredBlob> {
        ensure_key_safe(key)?;
        let file_path = self.blob_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("blob path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
            };
            size += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        // Release the source before committing so its close hook observes completion.
        drop(stream);

        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        Ok(StoredBlob {
            size,
            checksum: format!("{:x}", digest.compute()),
        })
    }

    async fn open(&self, key: &str) -> BlobResult<ByteStream<'static>> {
        ensure_key_safe(key)?;
        let file = File::open(self.blob_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Io(err)
            }
        })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn stat(&self, key: &str) -> BlobResult<StoredBlob> {
        let mut stream = self.open(key).await?;
        let mut size: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as i64;
            digest.consume(&chunk);
        }
        Ok(StoredBlob {
            size,
            checksum: format!("{:x}", digest.compute()),
        })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.blob_path(key);
        match fs::remove_file(&file_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(BlobError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn probe(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(BlobError::Io(io::Error::other("probe content mismatch")));
        }
        Ok(())
    }
}

/// Open a handle on the configured S3-compatible bucket.
pub fn connect_bucket(config: &RemoteStorageConfig) -> BlobResult<Box<Bucket>> {
    let credentials = Credentials::new(
        Some(&config.access_key),
        Some(&config.secret_key),
        None,
        None,
        None,
    )
    .map_err(|e| BlobError::Remote(format!("failed to build credentials: {}", e)))?;

    let region = Region::Custom {
        region: config.region.clone(),
        endpoint: config.endpoint.clone(),
    };

    let mut bucket = Bucket::new(&config.bucket, region, credentials)
        .map_err(|e| BlobError::Remote(format!("failed to open bucket: {}", e)))?;
    bucket.set_path_style();
    Ok(bucket)
}

fn ensure_success(status: u16, key: &str, action: &str) -> BlobResult<()> {
    match status {
        200..=299 => Ok(()),
        404 => Err(BlobError::NotFound(key.to_string())),
        other => Err(BlobError::Remote(format!(
            "{} `{}` returned status {}",
            action, key, other
        ))),
    }
}

/// Payloads in an S3-compatible bucket.
///
/// Bodies are streamed in both directions; large uploads become multipart
/// uploads inside rust-s3.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
}

impl S3BlobStore {
    pub fn new(bucket: Box<Bucket>) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        stream: ByteStream<'_>,
    ) -> BlobResult<StoredBlob> {
        ensure_key_safe(key)?;
        let mut size: i64 = 0;
        let mut digest = Context::new();
        // The source error is kept so callers can still recognise it after rust-s3 wraps it.
        let mut failure: Option<io::Error> = None;

        let result = {
            let observed = stream.map(|chunk| match chunk {
                Ok(chunk) => {
                    size += chunk.len() as i64;
                    digest.consume(&chunk);
                    Ok(chunk)
                }
                Err(err) => {
                    failure = Some(err);
                    Err(io::Error::other("upload stream failed"))
                }
            });
            let mut reader = StreamReader::new(observed);
            self.bucket
                .put_object_stream_with_content_type(&mut reader, key, content_type)
                .await
        };

        if let Some(err) = failure {
            if result.is_ok() {
                let _ = self.delete(key).await;
            }
            return Err(BlobError::Io(err));
        }
        let response =
            result.map_err(|e| BlobError::Remote(format!("failed to upload `{}`: {}", key, e)))?;
        ensure_success(response.status_code(), key, "upload")?;

        debug!("uploaded `{}` ({} bytes) to bucket `{}`", key, size, self.bucket.name());
        Ok(StoredBlob {
            size,
            checksum: format!("{:x}", digest.compute()),
        })
    }

    async fn open(&self, key: &str) -> BlobResult<ByteStream<'static>> {
        ensure_key_safe(key)?;
        let response = self
            .bucket
            .get_object_stream(key)
            .await
            .map_err(|e| BlobError::Remote(format!("failed to download `{}`: {}", key, e)))?;
        ensure_success(response.status_code, key, "download")?;

        Ok(Box::pin(
            response
                .bytes
                .map_err(|e| io::Error::other(format!("remote read failed: {}", e))),
        ))
    }

    async fn stat(&self, key: &str) -> BlobResult<StoredBlob> {
        ensure_key_safe(key)?;
        let (head, status) = self
            .bucket
            .head_object(key)
            .await
            .map_err(|e| BlobError::Remote(format!("failed to inspect `{}`: {}", key, e)))?;
        ensure_success(status, key, "inspect")?;

        let size = head
            .content_length
            .ok_or_else(|| BlobError::Remote(format!("`{}` has no content length", key)))?;
        Ok(StoredBlob {
            size,
            checksum: head
                .e_tag
                .map(|tag| tag.trim_matches('"').to_string())
                .unwrap_or_default(),
        })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        ensure_key_safe(key)?;
        let response = self
            .bucket
            .delete_object(key)
            .await
            .map_err(|e| BlobError::Remote(format!("failed to delete `{}`: {}", key, e)))?;
        match ensure_success(response.status_code(), key, "delete") {
            Ok(()) | Err(BlobError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn probe(&self) -> BlobResult<()> {
        let key = format!(".readyz-{}", Uuid::new_v4());
        let response = self
            .bucket
            .put_object_with_content_type(&key, b"readyz", "text/plain")
            .await
            .map_err(|e| BlobError::Remote(e.to_string()))?;
        ensure_success(response.status_code(), &key, "probe")?;
        self.delete(&key).await
    }
}
