//! Transfer orchestration.
//!
//! [`TransferGateway`] ties identity, ownership, hooks, providers and the two
//! stores together. Handlers translate HTTP into calls on it and nothing else.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::CallerIdentity,
    config::ProviderKind,
    errors::{GatewayError, GatewayResult},
    models::{
        bucket::Bucket,
        object::{NewObject, Object},
        token::DownloadToken,
    },
    services::{
        bandwidth::{BandwidthTracker, TransferSummary, is_limit_exceeded},
        blob_store::{BlobError, BlobStore, ByteStream, StoredBlob},
        hooks::{HookContext, HookDispatcher, HookPoint, HookStats, RequestSnapshot},
        object_store::{ObjectFilter, ObjectStats, ObjectStore, StoreError},
        provider::{DownloadTargetRequest, ProviderAdapter, TransferTarget, UploadTargetRequest},
        token_store::{TokenStats, TokenStore},
    },
};

const MAX_OBJECT_NAME_LEN: usize = 255;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Maps public bucket aliases onto stored bucket names.
#[derive(Clone, Debug)]
pub struct BucketAliases {
    internal: String,
}

impl BucketAliases {
    pub const USER_FILES: &'static str = "user-files";

    pub fn new(internal: impl Into<String>) -> Self {
        Self {
            internal: internal.into(),
        }
    }

    pub fn internal(&self) -> &str {
        &self.internal
    }

    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        if name == Self::USER_FILES {
            &self.internal
        } else {
            name
        }
    }

    pub fn is_internal(&self, name: &str) -> bool {
        self.resolve(name) == self.internal
    }
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub token_ttl: Duration,
    pub max_upload_size: i64,
    pub internal_bucket: String,
    pub quota_bytes: Option<i64>,
}

/// Upload streamed straight through the gateway.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub bucket: String,
    pub parent_folder_id: Option<Uuid>,
    pub name: String,
    pub content_type: String,
    /// Size announced by the client, handed to before-upload hooks.
    pub declared_size: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct UploadUrlRequest {
    pub bucket: String,
    pub filename: String,
    pub content_type: String,
    pub max_size: Option<i64>,
    pub parent_folder_id: Option<Uuid>,
}

pub struct DirectDownload {
    pub object: Object,
    pub body: ByteStream<'static>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QuotaReport {
    pub user_id: String,
    pub object_count: i64,
    pub used_bytes: i64,
    pub quota_bytes: Option<i64>,
    pub remaining_bytes: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GatewayStats {
    pub provider: ProviderKind,
    pub objects: ObjectStats,
    pub tokens: TokenStats,
    pub hooks: HookStats,
}

#[derive(Clone)]
pub struct TransferGateway {
    objects: Arc<dyn ObjectStore>,
    tokens: Arc<dyn TokenStore>,
    blobs: Arc<dyn BlobStore>,
    provider: Arc<dyn ProviderAdapter>,
    hooks: Arc<dyn HookDispatcher>,
    aliases: BucketAliases,
    settings: GatewaySettings,
}

impl TransferGateway {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        tokens: Arc<dyn TokenStore>,
        blobs: Arc<dyn BlobStore>,
        provider: Arc<dyn ProviderAdapter>,
        hooks: Arc<dyn HookDispatcher>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            objects,
            tokens,
            blobs,
            provider,
            hooks,
            aliases: BucketAliases::new(settings.internal_bucket.clone()),
            settings,
        }
    }

    /// Create the internal application bucket if it does not exist yet.
    pub async fn ensure_internal_bucket(&self) -> GatewayResult<Bucket> {
        let name = self.aliases.internal();
        match self.objects.get_bucket(name).await {
            Ok(bucket) => Ok(bucket),
            Err(StoreError::NotFound(_)) => match self.objects.create_bucket(name, false).await {
                Ok(bucket) => {
                    info!(bucket = %name, "created internal bucket");
                    Ok(bucket)
                }
                Err(StoreError::AlreadyExists(_)) => Ok(self.objects.get_bucket(name).await?),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        }
    }

    // ---- buckets -------------------------------------------------------------

    pub async fn create_bucket(
        &self,
        caller: &CallerIdentity,
        name: &str,
        public: bool,
    ) -> GatewayResult<Bucket> {
        require_admin(caller)?;
        validate_bucket_name(name)?;
        if self.aliases.is_internal(name) {
            return Err(GatewayError::AlreadyExists(format!("bucket `{}`", name)));
        }
        let bucket = self.objects.create_bucket(name, public).await?;
        info!(bucket = %bucket.name, public, user_id = %caller.user_id, "bucket created");
        Ok(bucket)
    }

    pub async fn list_buckets(&self) -> GatewayResult<Vec<Bucket>> {
        Ok(self.objects.list_buckets().await?)
    }

    /// Delete a bucket; with `cascade` every object and payload goes first.
    pub async fn delete_bucket(
        &self,
        caller: &CallerIdentity,
        name: &str,
        cascade: bool,
    ) -> GatewayResult<()> {
        require_admin(caller)?;
        let bucket = self.resolve_bucket(name).await?;
        if cascade {
            let contents = self.objects.list_bucket_objects(bucket.id).await?;
            let removed = contents.len();
            self.remove_objects(deletion_order(contents)).await?;
            debug!(bucket = %bucket.name, removed, "cascaded bucket contents");
        }
        self.objects.delete_bucket(&bucket.name).await?;
        info!(bucket = %bucket.name, cascade, "bucket deleted");
        Ok(())
    }

    // ---- objects -------------------------------------------------------------

    pub async fn list_objects(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        parent_folder_id: Option<Uuid>,
    ) -> GatewayResult<Vec<Object>> {
        let bucket = self.resolve_bucket(bucket).await?;
        self.ensure_parent(caller, &bucket, parent_folder_id).await?;
        let filter = self.owner_scope(caller, &bucket, parent_folder_id);
        Ok(self.objects.list_objects(bucket.id, &filter).await?)
    }

    pub async fn create_folder(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        name: &str,
        parent_folder_id: Option<Uuid>,
    ) -> GatewayResult<Object> {
        validate_object_name(name)?;
        let bucket = self.resolve_bucket(bucket).await?;
        self.ensure_parent(caller, &bucket, parent_folder_id).await?;
        self.ensure_name_free(caller, &bucket, parent_folder_id, name)
            .await?;
        let folder = NewObject::folder(
            bucket.id,
            name,
            parent_folder_id,
            caller.user_id.clone(),
            caller.app_id.clone(),
        );
        Ok(self.objects.create_object(folder).await?)
    }

    pub async fn get_object(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        object_id: Uuid,
    ) -> GatewayResult<Object> {
        let bucket = self.resolve_bucket(bucket).await?;
        let object = self.object_in_bucket(&bucket, object_id).await?;
        if !self.can_read(caller, &bucket, &object) {
            return Err(access_denied(&object));
        }
        Ok(object)
    }

    /// Delete an object; folders take their whole subtree with them.
    pub async fn delete_object(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        object_id: Uuid,
    ) -> GatewayResult<()> {
        let bucket = self.resolve_bucket(bucket).await?;
        let object = self.object_in_bucket(&bucket, object_id).await?;
        if !self.owns(caller, &bucket, &object) {
            return Err(access_denied(&object));
        }

        let mut subtree = vec![object.clone()];
        let mut pending = VecDeque::from([object.id]);
        while let Some(folder_id) = pending.pop_front() {
            for child in self.objects.list_children(folder_id).await? {
                if child.is_folder() {
                    pending.push_back(child.id);
                }
                subtree.push(child);
            }
        }
        self.remove_objects(deletion_order(subtree)).await?;
        info!(object_id = %object.id, bucket = %bucket.name, "object deleted");
        Ok(())
    }

    pub async fn rename_object(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        object_id: Uuid,
        name: &str,
    ) -> GatewayResult<Object> {
        validate_object_name(name)?;
        let bucket = self.resolve_bucket(bucket).await?;
        let object = self.object_in_bucket(&bucket, object_id).await?;
        if !self.owns(caller, &bucket, &object) {
            return Err(access_denied(&object));
        }
        Ok(self.objects.rename_object(object.id, name).await?)
    }

    pub async fn update_metadata(
        &self,
        caller: &CallerIdentity,
        bucket: &str,
        object_id: Uuid,
        metadata: &Value,
    ) -> GatewayResult<Object> {
        if !metadata.is_object() {
            return Err(GatewayError::BadRequest(
                "metadata must be a JSON object".into(),
            ));
        }
        let bucket = self.resolve_bucket(bucket).await?;
        let object = self.object_in_bucket(&bucket, object_id).await?;
        if !self.owns(caller, &bucket, &object) {
            return Err(access_denied(&object));
        }
        Ok(self.objects.update_object_metadata(object.id, metadata).await?)
    }

    // ---- uploads -------------------------------------------------------------

    /// Stream a request body into a new object.
    pub async fn upload_stream(
        &self,
        caller: &CallerIdentity,
        snapshot: &RequestSnapshot,
        request: UploadRequest,
        body: ByteStream<'_>,
    ) -> GatewayResult<Object> {
        validate_object_name(&request.name)?;
        let bucket = self.resolve_bucket(&request.bucket).await?;
        self.ensure_parent(caller, &bucket, request.parent_folder_id)
            .await?;

        let mut ctx = HookContext {
            user_id: Some(caller.user_id.clone()),
            app_id: caller.app_id.clone(),
            bucket: Some(bucket.name.clone()),
            object_name: Some(request.name.clone()),
            content_type: Some(request.content_type.clone()),
            bytes: request.declared_size,
            request: Some(snapshot.clone()),
            ..Default::default()
        };
        self.hooks.execute_hooks(HookPoint::BeforeUpload, &ctx).await?;
        self.ensure_name_free(caller, &bucket, request.parent_folder_id, &request.name)
            .await?;

        let key = storage_key(&bucket.name);
        let (stored, _) = self
            .write_payload(&key, &request.content_type, body, self.settings.max_upload_size)
            .await;
        let stored = stored?;

        let object = self
            .insert_object(NewObject {
                id: Uuid::new_v4(),
                bucket_id: bucket.id,
                name: request.name,
                parent_folder_id: request.parent_folder_id,
                size: stored.size,
                content_type: request.content_type,
                checksum: Some(stored.checksum),
                metadata: request.metadata.unwrap_or_else(|| json!({})),
                user_id: caller.user_id.clone(),
                app_id: caller.app_id.clone(),
                storage_key: Some(key),
            })
            .await?;

        ctx.object_id = Some(object.id);
        ctx.bytes = Some(object.size);
        ctx.response_status = Some(201);
        self.hooks.submit_after(HookPoint::AfterUpload, ctx);
        Ok(object)
    }

    /// Issue an upload target. Bytes arrive later through the target.
    pub async fn issue_upload_target(
        &self,
        caller: &CallerIdentity,
        snapshot: &RequestSnapshot,
        request: UploadUrlRequest,
    ) -> GatewayResult<TransferTarget> {
        validate_object_name(&request.filename)?;
        let bucket = self.resolve_bucket(&request.bucket).await?;
        self.ensure_parent(caller, &bucket, request.parent_folder_id)
            .await?;

        let limit = self.settings.max_upload_size;
        let max_size = match request.max_size {
            Some(size) if size <= 0 => {
                return Err(GatewayError::BadRequest("maxSize must be positive".into()));
            }
            Some(size) if size > limit => return Err(GatewayError::SizeExceeded { max: limit }),
            Some(size) => size,
            None => limit,
        };

        let ctx = HookContext {
            user_id: Some(caller.user_id.clone()),
            app_id: caller.app_id.clone(),
            bucket: Some(bucket.name.clone()),
            object_name: Some(request.filename.clone()),
            content_type: Some(request.content_type.clone()),
            bytes: Some(max_size),
            request: Some(snapshot.clone()),
            ..Default::default()
        };
        self.hooks.execute_hooks(HookPoint::BeforeUpload, &ctx).await?;
        self.ensure_name_free(caller, &bucket, request.parent_folder_id, &request.filename)
            .await?;

        let (target, token) = self
            .provider
            .generate_upload_target(
                UploadTargetRequest {
                    storage_key: storage_key(&bucket.name),
                    bucket: bucket.name,
                    parent_folder_id: request.parent_folder_id,
                    object_name: request.filename,
                    content_type: request.content_type,
                    max_size,
                    user_id: caller.user_id.clone(),
                    app_id: caller.app_id.clone(),
                    client_ip: snapshot.client_ip.clone(),
                },
                self.settings.token_ttl,
            )
            .await?;
        debug!(token_id = %token.id, kind = ?target.kind, "upload target issued");
        Ok(target)
    }

    /// Accept the bytes for a previously issued upload token.
    pub async fn direct_upload(
        &self,
        token: &str,
        snapshot: &RequestSnapshot,
        declared_len: Option<i64>,
        body: ByteStream<'_>,
    ) -> GatewayResult<Object> {
        let token = self.tokens.get_upload_token_by_token(token).await?;
        if token.is_expired(Utc::now()) {
            return Err(GatewayError::TokenExpired);
        }
        if token.completed {
            return Err(GatewayError::AlreadyCompleted);
        }
        if declared_len.is_some_and(|len| len > token.max_size) {
            return Err(GatewayError::SizeExceeded {
                max: token.max_size,
            });
        }
        let bucket = self.objects.get_bucket(&token.bucket).await?;

        // Each attempt writes to its own key so a losing racer never clobbers the winner.
        let key = storage_key(&bucket.name);
        let (stored, seen) = self
            .write_payload(&key, &token.content_type, body, token.max_size)
            .await;
        let stored = match stored {
            Ok(stored) => stored,
            Err(err) => {
                if let Err(mark_err) = self
                    .tokens
                    .mark_upload_progress(token.id, clamp_bytes(seen))
                    .await
                {
                    warn!(token_id = %token.id, error = %mark_err, "failed to record upload progress");
                }
                return Err(err);
            }
        };

        let object_id = Uuid::new_v4();
        if let Err(err) = self
            .tokens
            .complete_upload_token(token.id, object_id, stored.size)
            .await
        {
            self.discard_blob(&key).await;
            return Err(err.into());
        }

        let object = self
            .insert_object(NewObject {
                id: object_id,
                bucket_id: bucket.id,
                name: token.object_name.clone(),
                parent_folder_id: token.parent_folder_id,
                size: stored.size,
                content_type: token.content_type.clone(),
                checksum: Some(stored.checksum),
                metadata: json!({}),
                user_id: token.user_id.clone(),
                app_id: token.app_id.clone(),
                storage_key: Some(key),
            })
            .await?;

        self.hooks.submit_after(
            HookPoint::AfterUpload,
            HookContext {
                user_id: Some(token.user_id),
                app_id: token.app_id,
                bucket: Some(bucket.name),
                object_id: Some(object.id),
                object_name: Some(object.name.clone()),
                content_type: Some(object.content_type.clone()),
                bytes: Some(object.size),
                request: Some(snapshot.clone()),
                response_status: Some(201),
            },
        );
        Ok(object)
    }

    /// Completion notice for a presigned upload. Repeats return the same object.
    ///
    /// Size and checksum are read back from the stored payload; the values the
    /// client reports are only compared against them.
    pub async fn upload_callback(
        &self,
        token: &str,
        size: i64,
        checksum: Option<String>,
    ) -> GatewayResult<Object> {
        let token = self.tokens.get_upload_token_by_token(token).await?;
        if token.is_expired(Utc::now()) {
            return Err(GatewayError::TokenExpired);
        }
        if token.completed {
            return self.completed_upload_object(token.object_id).await;
        }
        if size < 0 {
            return Err(GatewayError::BadRequest("size must not be negative".into()));
        }

        let stored = self.blobs.stat(&token.storage_key).await?;
        if stored.size > token.max_size {
            warn!(token_id = %token.id, size = stored.size, max = token.max_size, "presigned upload over limit");
            self.discard_blob(&token.storage_key).await;
            return Err(GatewayError::SizeExceeded {
                max: token.max_size,
            });
        }
        if stored.size != size {
            warn!(token_id = %token.id, reported = size, actual = stored.size, "upload callback size mismatch");
        }
        if let Some(reported) = checksum.filter(|c| !c.eq_ignore_ascii_case(&stored.checksum)) {
            warn!(token_id = %token.id, %reported, actual = %stored.checksum, "upload callback checksum mismatch");
        }
        let bucket = self.objects.get_bucket(&token.bucket).await?;

        let object_id = Uuid::new_v4();
        match self
            .tokens
            .complete_upload_token(token.id, object_id, stored.size)
            .await
        {
            Ok(_) => {}
            Err(StoreError::AlreadyCompleted) => {
                let current = self.tokens.get_upload_token_by_token(&token.token).await?;
                return self.completed_upload_object(current.object_id).await;
            }
            Err(err) => return Err(err.into()),
        }

        let object = self
            .insert_object(NewObject {
                id: object_id,
                bucket_id: bucket.id,
                name: token.object_name.clone(),
                parent_folder_id: token.parent_folder_id,
                size: stored.size,
                content_type: token.content_type.clone(),
                checksum: Some(stored.checksum),
                metadata: json!({}),
                user_id: token.user_id.clone(),
                app_id: token.app_id.clone(),
                storage_key: Some(token.storage_key.clone()),
            })
            .await?;

        self.hooks.submit_after(
            HookPoint::AfterUpload,
            HookContext {
                user_id: Some(token.user_id),
                app_id: token.app_id,
                bucket: Some(bucket.name),
                object_id: Some(object.id),
                object_name: Some(object.name.clone()),
                content_type: Some(object.content_type.clone()),
                bytes: Some(object.size),
                ..Default::default()
            },
        );
        Ok(object)
    }

    // ---- downloads -----------------------------------------------------------

    pub async fn issue_download_target(
        &self,
        caller: &CallerIdentity,
        snapshot: &RequestSnapshot,
        bucket: &str,
        object_id: Uuid,
    ) -> GatewayResult<TransferTarget> {
        let bucket = self.resolve_bucket(bucket).await?;
        let object = self.object_in_bucket(&bucket, object_id).await?;
        if !self.can_read(caller, &bucket, &object) {
            return Err(access_denied(&object));
        }
        let storage_key = match (&object.storage_key, object.is_folder()) {
            (Some(key), false) => key.clone(),
            _ => {
                return Err(GatewayError::BadRequest(format!(
                    "`{}` has no content to download",
                    object.name
                )));
            }
        };

        let ctx = HookContext {
            user_id: Some(caller.user_id.clone()),
            app_id: caller.app_id.clone(),
            bucket: Some(bucket.name.clone()),
            object_id: Some(object.id),
            object_name: Some(object.name.clone()),
            content_type: Some(object.content_type.clone()),
            bytes: Some(object.size),
            request: Some(snapshot.clone()),
            ..Default::default()
        };
        self.hooks
            .execute_hooks(HookPoint::BeforeDownload, &ctx)
            .await?;

        let (target, token) = self
            .provider
            .generate_download_target(
                DownloadTargetRequest {
                    object_id: object.id,
                    bucket: bucket.name,
                    object_name: object.name,
                    storage_key,
                    file_size: object.size,
                    user_id: caller.user_id.clone(),
                    client_ip: snapshot.client_ip.clone(),
                },
                self.settings.token_ttl,
            )
            .await?;
        debug!(token_id = %token.id, kind = ?target.kind, "download target issued");
        Ok(target)
    }

    /// Open the payload behind a download token.
    ///
    /// Only one stream is ever granted per token. It is finalized when the
    /// returned body closes, however it closes.
    pub async fn open_direct_download(
        &self,
        token: &str,
        snapshot: &RequestSnapshot,
    ) -> GatewayResult<DirectDownload> {
        let token = self.tokens.get_download_token_by_token(token).await?;
        if token.is_expired(Utc::now()) {
            return Err(GatewayError::TokenExpired);
        }
        if token.completed {
            return Err(GatewayError::AlreadyCompleted);
        }
        let object = self.objects.get_object(token.object_id).await?;
        let key = object
            .storage_key
            .clone()
            .ok_or_else(|| GatewayError::NotFound(format!("payload of `{}`", object.name)))?;
        let source = self.blobs.open(&key).await?;
        self.tokens.claim_download_token(token.id).await?;

        let ctx = HookContext {
            user_id: Some(token.user_id.clone()),
            bucket: Some(token.bucket.clone()),
            object_id: Some(object.id),
            object_name: Some(object.name.clone()),
            content_type: Some(object.content_type.clone()),
            request: Some(snapshot.clone()),
            response_status: Some(200),
            ..Default::default()
        };
        let gateway = self.clone();
        let token_id = token.id;
        let object_id = object.id;
        let body = BandwidthTracker::new(source).on_close(move |summary| {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        gateway
                            .finalize_download(token_id, object_id, summary, ctx)
                            .await;
                    });
                }
                Err(_) => warn!(token_id = %token_id, "no runtime available to finalize download"),
            }
        });

        Ok(DirectDownload {
            object,
            body: Box::pin(body),
        })
    }

    async fn finalize_download(
        &self,
        token_id: Uuid,
        object_id: Uuid,
        summary: TransferSummary,
        mut ctx: HookContext,
    ) {
        let bytes = clamp_bytes(summary.bytes);
        if !summary.finished {
            info!(token_id = %token_id, bytes, "download closed before the end of the payload");
        }
        match self.tokens.complete_download_token(token_id, bytes).await {
            Ok(_) => {}
            Err(StoreError::AlreadyCompleted) => {
                debug!(token_id = %token_id, "download token already finalized");
                return;
            }
            Err(err) => {
                warn!(token_id = %token_id, error = %err, "failed to finalize download token");
                return;
            }
        }
        if let Err(err) = self.objects.touch_last_viewed(object_id).await {
            warn!(object_id = %object_id, error = %err, "failed to record last view");
        }
        ctx.bytes = Some(bytes);
        self.hooks.submit_after(HookPoint::AfterDownload, ctx);
    }

    /// Progress or completion notice for a presigned download.
    pub async fn download_callback(
        &self,
        token: &str,
        bytes_served: i64,
        completed: bool,
    ) -> GatewayResult<DownloadToken> {
        let mut token = self.tokens.get_download_token_by_token(token).await?;
        if token.is_expired(Utc::now()) {
            return Err(GatewayError::TokenExpired);
        }
        if token.completed {
            return Err(GatewayError::AlreadyCompleted);
        }
        if bytes_served < 0 {
            return Err(GatewayError::BadRequest(
                "bytes_served must not be negative".into(),
            ));
        }

        if !completed {
            self.tokens
                .mark_download_progress(token.id, bytes_served)
                .await?;
            token.bytes_served = bytes_served;
            return Ok(token);
        }

        let done = self
            .tokens
            .complete_download_token(token.id, bytes_served)
            .await?;
        if let Err(err) = self.objects.touch_last_viewed(done.object_id).await {
            warn!(object_id = %done.object_id, error = %err, "failed to record last view");
        }
        self.hooks.submit_after(
            HookPoint::AfterDownload,
            HookContext {
                user_id: Some(done.user_id.clone()),
                bucket: Some(done.bucket.clone()),
                object_id: Some(done.object_id),
                object_name: Some(done.object_name.clone()),
                bytes: Some(bytes_served),
                ..Default::default()
            },
        );
        Ok(done)
    }

    // ---- accounting ----------------------------------------------------------

    pub async fn quota(&self, caller: &CallerIdentity) -> GatewayResult<QuotaReport> {
        let usage = self.objects.usage_for_user(&caller.user_id).await?;
        let quota = self.settings.quota_bytes;
        Ok(QuotaReport {
            user_id: caller.user_id.clone(),
            object_count: usage.object_count,
            used_bytes: usage.bytes,
            quota_bytes: quota,
            remaining_bytes: quota.map(|q| (q - usage.bytes).max(0)),
        })
    }

    pub async fn stats(&self, caller: &CallerIdentity) -> GatewayResult<GatewayStats> {
        require_admin(caller)?;
        Ok(GatewayStats {
            provider: self.provider.kind(),
            objects: self.objects.stats().await?,
            tokens: self.tokens.stats(Utc::now()).await?,
            hooks: self.hooks.stats(),
        })
    }

    /// Notify post-login hooks on behalf of the session service.
    pub fn post_login(&self, caller: &CallerIdentity, snapshot: &RequestSnapshot) {
        self.hooks.submit_after(
            HookPoint::PostLogin,
            HookContext {
                user_id: Some(caller.user_id.clone()),
                app_id: caller.app_id.clone(),
                request: Some(snapshot.clone()),
                ..Default::default()
            },
        );
    }

    pub async fn check_store(&self) -> GatewayResult<()> {
        Ok(self.objects.ping().await?)
    }

    pub async fn check_blobs(&self) -> GatewayResult<()> {
        Ok(self.blobs.probe().await?)
    }

    // ---- helpers -------------------------------------------------------------

    async fn resolve_bucket(&self, name: &str) -> GatewayResult<Bucket> {
        Ok(self.objects.get_bucket(self.aliases.resolve(name)).await?)
    }

    async fn object_in_bucket(&self, bucket: &Bucket, object_id: Uuid) -> GatewayResult<Object> {
        let object = self.objects.get_object(object_id).await?;
        if object.bucket_id != bucket.id {
            return Err(GatewayError::NotFound(format!("object `{}`", object_id)));
        }
        Ok(object)
    }

    fn owns(&self, caller: &CallerIdentity, bucket: &Bucket, object: &Object) -> bool {
        if object.user_id == caller.user_id {
            return true;
        }
        self.aliases.is_internal(&bucket.name)
            && caller.app_id.is_some()
            && object.app_id == caller.app_id
    }

    fn can_read(&self, caller: &CallerIdentity, bucket: &Bucket, object: &Object) -> bool {
        bucket.public || self.owns(caller, bucket, object)
    }

    async fn ensure_parent(
        &self,
        caller: &CallerIdentity,
        bucket: &Bucket,
        parent_folder_id: Option<Uuid>,
    ) -> GatewayResult<()> {
        let Some(parent_id) = parent_folder_id else {
            return Ok(());
        };
        let parent = match self.objects.get_object(parent_id).await {
            Ok(parent) => parent,
            Err(StoreError::NotFound(_)) => {
                return Err(GatewayError::NotFound(format!("parent folder `{}`", parent_id)));
            }
            Err(err) => return Err(err.into()),
        };
        if parent.bucket_id != bucket.id {
            return Err(GatewayError::InvalidParent(format!(
                "folder `{}` belongs to another bucket",
                parent_id
            )));
        }
        if !parent.is_folder() {
            return Err(GatewayError::InvalidParent(format!(
                "`{}` is not a folder",
                parent.name
            )));
        }
        if !self.owns(caller, bucket, &parent) {
            return Err(access_denied(&parent));
        }
        Ok(())
    }

    /// Rows the caller may see at one level: their own, plus their
    /// application's inside the internal bucket.
    fn owner_scope(
        &self,
        caller: &CallerIdentity,
        bucket: &Bucket,
        parent_folder_id: Option<Uuid>,
    ) -> ObjectFilter {
        ObjectFilter {
            owner_id: Some(caller.user_id.clone()),
            app_id: if self.aliases.is_internal(&bucket.name) {
                caller.app_id.clone()
            } else {
                None
            },
            parent_folder_id,
        }
    }

    /// Names only collide with siblings the caller can see.
    async fn ensure_name_free(
        &self,
        caller: &CallerIdentity,
        bucket: &Bucket,
        parent_folder_id: Option<Uuid>,
        name: &str,
    ) -> GatewayResult<()> {
        let scope = self.owner_scope(caller, bucket, parent_folder_id);
        match self
            .objects
            .get_object_by_path(bucket.id, &scope, name)
            .await
        {
            Ok(_) => Err(GatewayError::AlreadyExists(format!("object `{}`", name))),
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stream `body` into `key` under a byte limit. Also returns the bytes seen.
    async fn write_payload(
        &self,
        key: &str,
        content_type: &str,
        body: ByteStream<'_>,
        limit: i64,
    ) -> (GatewayResult<StoredBlob>, u64) {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let tracked = BandwidthTracker::new(body)
            .with_limit(limit.max(0) as u64)
            .on_close(move |summary| counter.store(summary.bytes, Ordering::Relaxed));

        let result = self
            .blobs
            .put_stream(key, content_type, Box::pin(tracked))
            .await
            .map_err(|err| match err {
                BlobError::Io(io) if is_limit_exceeded(&io) => {
                    GatewayError::SizeExceeded { max: limit }
                }
                other => other.into(),
            });
        (result, seen.load(Ordering::Relaxed))
    }

    /// Insert a row; the payload is removed again if the insert fails.
    async fn insert_object(&self, object: NewObject) -> GatewayResult<Object> {
        let key = object.storage_key.clone();
        match self.objects.create_object(object).await {
            Ok(created) => Ok(created),
            Err(err) => {
                if let Some(key) = key {
                    self.discard_blob(&key).await;
                }
                Err(err.into())
            }
        }
    }

    async fn discard_blob(&self, key: &str) {
        if let Err(err) = self.blobs.delete(key).await {
            warn!(storage_key = %key, error = %err, "failed to remove payload");
        }
    }

    async fn completed_upload_object(&self, object_id: Option<Uuid>) -> GatewayResult<Object> {
        match object_id {
            Some(id) => Ok(self.objects.get_object(id).await?),
            None => Err(GatewayError::AlreadyCompleted),
        }
    }

    /// Remove rows (children first) and their payloads.
    async fn remove_objects(&self, ordered: Vec<Object>) -> GatewayResult<()> {
        for object in ordered {
            if let Some(key) = &object.storage_key {
                self.discard_blob(key).await;
            }
            match self.objects.delete_object(object.id).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Order objects so every child precedes its parent folder.
fn deletion_order(objects: Vec<Object>) -> Vec<Object> {
    let mut children: HashMap<Option<Uuid>, Vec<Object>> = HashMap::new();
    let ids: std::collections::HashSet<Uuid> = objects.iter().map(|o| o.id).collect();
    for object in objects {
        // Nodes whose parent is outside the set act as roots.
        let parent = object.parent_folder_id.filter(|p| ids.contains(p));
        children.entry(parent).or_default().push(object);
    }

    let mut ordered = Vec::new();
    let mut queue: VecDeque<Object> = children.remove(&None).unwrap_or_default().into();
    while let Some(object) = queue.pop_front() {
        if let Some(kids) = children.remove(&Some(object.id)) {
            queue.extend(kids);
        }
        ordered.push(object);
    }
    ordered.reverse();
    ordered
}

fn storage_key(bucket: &str) -> String {
    format!("{}/{}", bucket, Uuid::new_v4())
}

fn clamp_bytes(bytes: u64) -> i64 {
    bytes.min(i64::MAX as u64) as i64
}

fn require_admin(caller: &CallerIdentity) -> GatewayResult<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(GatewayError::AccessDenied(
            "bucket administration requires the admin role".into(),
        ))
    }
}

fn access_denied(object: &Object) -> GatewayError {
    GatewayError::AccessDenied(format!("`{}` belongs to another owner", object.name))
}

fn invalid_name(name: &str, reason: &str) -> GatewayError {
    GatewayError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Object names are single path segments.
fn validate_object_name(name: &str) -> GatewayResult<()> {
    if name.trim().is_empty() {
        return Err(invalid_name(name, "must not be empty"));
    }
    if name.len() > MAX_OBJECT_NAME_LEN {
        return Err(invalid_name(name, "must be at most 255 bytes"));
    }
    if name == "." || name == ".." {
        return Err(invalid_name(name, "is reserved"));
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(invalid_name(
            name,
            "must not contain slashes or control characters",
        ));
    }
    Ok(())
}

/// Bucket names follow S3-like rules so they double as storage key prefixes.
fn validate_bucket_name(name: &str) -> GatewayResult<()> {
    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid_name(name, "must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid_name(
            name,
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid_name(
            name,
            "must start and end with a lowercase letter or digit",
        ));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid_name(
            name,
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if name.split('.').count() == 4 && name.split('.').all(|p| p.parse::<u8>().is_ok()) {
        return Err(invalid_name(name, "must not be formatted like an IP address"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::DiskBlobStore;
    use crate::test_support::{TestHarness, alice, bob, byte_body, chunked_body};
    use futures::StreamExt;

    async fn read_all(mut body: ByteStream<'static>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn pdf_request(bucket: &str, max: Option<i64>) -> UploadUrlRequest {
        UploadUrlRequest {
            bucket: bucket.into(),
            filename: "report.pdf".into(),
            content_type: "application/pdf".into(),
            max_size: max,
            parent_folder_id: None,
        }
    }

    fn token_of(target: &TransferTarget) -> &str {
        target
            .url
            .rsplit('/')
            .next()
            .expect("token in url")
    }

    /// Store bytes where a presigned PUT for `target` would have put them.
    async fn stage_payload(h: &TestHarness, target: &TransferTarget, data: &[u8]) {
        let token = h
            .tokens
            .get_upload_token_by_token(token_of(target))
            .await
            .unwrap();
        DiskBlobStore::new(h.blob_dir.clone())
            .put_stream(&token.storage_key, "application/pdf", byte_body(data.to_vec()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn token_upload_is_single_use() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();

        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(1000)))
            .await
            .unwrap();
        assert!(target.url.starts_with("/storage/direct-upload/"));

        let object = h
            .gateway
            .direct_upload(token_of(&target), &h.snapshot(), Some(500), byte_body(vec![7u8; 500]))
            .await
            .unwrap();
        assert_eq!(object.size, 500);
        assert_eq!(object.content_type, "application/pdf");
        assert_eq!(object.user_id, "alice");

        let again = h
            .gateway
            .direct_upload(token_of(&target), &h.snapshot(), Some(500), byte_body(vec![7u8; 500]))
            .await;
        assert!(matches!(again, Err(GatewayError::AlreadyCompleted)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_direct_uploads_create_one_object() {
        let h = TestHarness::shared().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(1000)))
            .await
            .unwrap();
        let token = token_of(&target).to_string();

        let attempts = (0..4).map(|_| {
            let gateway = h.gateway.clone();
            let token = token.clone();
            let snapshot = h.snapshot();
            tokio::spawn(async move {
                gateway
                    .direct_upload(&token, &snapshot, None, byte_body(vec![1u8; 100]))
                    .await
            })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter(|r| r.is_err())
                .all(|r| matches!(r, Err(GatewayError::AlreadyCompleted)))
        );

        let listed = h.gateway.list_objects(&alice(), "docs", None).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn expired_token_is_rejected_before_streaming() {
        let h = TestHarness::with_ttl(Duration::from_secs(0)).await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(1000)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let result = h
            .gateway
            .direct_upload(token_of(&target), &h.snapshot(), None, byte_body(vec![1u8; 10]))
            .await;
        assert!(matches!(result, Err(GatewayError::TokenExpired)));
    }

    #[tokio::test]
    async fn oversize_stream_leaves_no_object() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(10)))
            .await
            .unwrap();

        let result = h
            .gateway
            .direct_upload(
                token_of(&target),
                &h.snapshot(),
                None,
                chunked_body(vec![vec![0u8; 6], vec![0u8; 6]]),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::SizeExceeded { max: 10 })));
        assert!(h.gateway.list_objects(&alice(), "docs", None).await.unwrap().is_empty());
        assert_eq!(h.payload_files(), 0);

        let declared = h
            .gateway
            .direct_upload(token_of(&target), &h.snapshot(), Some(11), byte_body(vec![0u8; 11]))
            .await;
        assert!(matches!(declared, Err(GatewayError::SizeExceeded { .. })));
    }

    #[tokio::test]
    async fn veto_leaves_object_count_unchanged() {
        let h = TestHarness::with_quota(100).await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();

        let err = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(500)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Quota exceeded");
        assert_eq!(err.status(), axum::http::StatusCode::INSUFFICIENT_STORAGE);

        let upload = h
            .gateway
            .upload_stream(
                &alice(),
                &h.snapshot(),
                UploadRequest {
                    bucket: "docs".into(),
                    parent_folder_id: None,
                    name: "big.bin".into(),
                    content_type: "application/octet-stream".into(),
                    declared_size: Some(101),
                    metadata: None,
                },
                byte_body(vec![0u8; 101]),
            )
            .await;
        assert!(matches!(upload, Err(GatewayError::HookVetoed { .. })));
        assert_eq!(h.gateway.quota(&alice()).await.unwrap().object_count, 0);
    }

    #[tokio::test]
    async fn folder_listing_follows_parent() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let a = h.gateway.create_folder(&alice(), "docs", "A", None).await.unwrap();
        let b = h
            .gateway
            .create_folder(&alice(), "docs", "B", Some(a.id))
            .await
            .unwrap();

        let root = h.gateway.list_objects(&alice(), "docs", None).await.unwrap();
        assert_eq!(root.iter().map(|o| o.id).collect::<Vec<_>>(), vec![a.id]);
        let inside = h
            .gateway
            .list_objects(&alice(), "docs", Some(a.id))
            .await
            .unwrap();
        assert_eq!(inside.iter().map(|o| o.id).collect::<Vec<_>>(), vec![b.id]);
    }

    #[tokio::test]
    async fn parent_validation_errors() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let file = h.upload(&alice(), "docs", "notes.txt", b"hi").await;

        let missing = h
            .gateway
            .create_folder(&alice(), "docs", "X", Some(Uuid::new_v4()))
            .await;
        assert!(matches!(missing, Err(GatewayError::NotFound(_))));

        let not_folder = h
            .gateway
            .create_folder(&alice(), "docs", "X", Some(file.id))
            .await;
        assert!(matches!(not_folder, Err(GatewayError::InvalidParent(_))));

        let bad_name = h.gateway.create_folder(&alice(), "docs", "a/b", None).await;
        assert!(matches!(bad_name, Err(GatewayError::InvalidName { .. })));
    }

    #[tokio::test]
    async fn other_users_are_denied() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let object = h.upload(&alice(), "docs", "secret.txt", b"top secret").await;

        assert!(matches!(
            h.gateway.get_object(&bob(), "docs", object.id).await,
            Err(GatewayError::AccessDenied(_))
        ));
        assert!(matches!(
            h.gateway
                .issue_download_target(&bob(), &h.snapshot(), "docs", object.id)
                .await,
            Err(GatewayError::AccessDenied(_))
        ));
        assert!(matches!(
            h.gateway.delete_object(&bob(), "docs", object.id).await,
            Err(GatewayError::AccessDenied(_))
        ));
        assert!(h.gateway.list_objects(&bob(), "docs", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn internal_bucket_shares_by_application() {
        let h = TestHarness::new().await;
        let crm_alice = CallerIdentity {
            app_id: Some("crm".into()),
            ..alice()
        };
        let crm_bob = CallerIdentity {
            app_id: Some("crm".into()),
            ..bob()
        };
        let object = h.upload(&crm_alice, "user-files", "shared.txt", b"crm data").await;

        let fetched = h
            .gateway
            .get_object(&crm_bob, "user-files", object.id)
            .await
            .unwrap();
        assert_eq!(fetched.app_id.as_deref(), Some("crm"));
        assert_eq!(
            h.gateway
                .list_objects(&crm_bob, "int_storage", None)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(matches!(
            h.gateway.get_object(&bob(), "user-files", object.id).await,
            Err(GatewayError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn download_counts_bytes_and_finalizes_once() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let object = h.upload(&alice(), "docs", "data.bin", &[5u8; 4096]).await;

        let target = h
            .gateway
            .issue_download_target(&alice(), &h.snapshot(), "docs", object.id)
            .await
            .unwrap();
        let download = h
            .gateway
            .open_direct_download(token_of(&target), &h.snapshot())
            .await
            .unwrap();
        assert_eq!(read_all(download.body).await, vec![5u8; 4096]);

        let token = h.wait_for_download(token_of(&target)).await;
        assert_eq!(token.bytes_served, 4096);
        // upload + download after-hooks; the download one runs after the view is recorded
        h.wait_for_hooks(2).await;
        let viewed = h.gateway.get_object(&alice(), "docs", object.id).await.unwrap();
        assert!(viewed.last_viewed_at.is_some());

        assert!(matches!(
            h.gateway
                .open_direct_download(token_of(&target), &h.snapshot())
                .await,
            Err(GatewayError::AlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn aborted_download_still_records_bytes() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let payload = vec![9u8; 64 * 1024];
        let object = h.upload(&alice(), "docs", "big.bin", &payload).await;

        let target = h
            .gateway
            .issue_download_target(&alice(), &h.snapshot(), "docs", object.id)
            .await
            .unwrap();
        let mut download = h
            .gateway
            .open_direct_download(token_of(&target), &h.snapshot())
            .await
            .unwrap();
        let first = download.body.next().await.unwrap().unwrap();
        drop(download);

        let token = h.wait_for_download(token_of(&target)).await;
        assert_eq!(token.bytes_served, first.len() as i64);
        assert!(token.bytes_served < payload.len() as i64);
    }

    #[tokio::test]
    async fn upload_callback_is_idempotent() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(1000)))
            .await
            .unwrap();
        stage_payload(&h, &target, &[3u8; 800]).await;

        let first = h
            .gateway
            .upload_callback(token_of(&target), 800, Some("abc".into()))
            .await
            .unwrap();
        let second = h
            .gateway
            .upload_callback(token_of(&target), 800, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        let expected = format!("{:x}", md5::compute([3u8; 800]));
        assert_eq!(first.checksum.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn upload_callback_records_stored_bytes_not_reported_ones() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(1000)))
            .await
            .unwrap();
        stage_payload(&h, &target, &[1u8; 600]).await;

        let object = h
            .gateway
            .upload_callback(token_of(&target), 1, None)
            .await
            .unwrap();
        assert_eq!(object.size, 600);
        assert_eq!(h.gateway.quota(&alice()).await.unwrap().used_bytes, 600);
    }

    #[tokio::test]
    async fn upload_callback_rejects_oversize_payload() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(10)))
            .await
            .unwrap();
        stage_payload(&h, &target, &[0u8; 20]).await;

        let result = h.gateway.upload_callback(token_of(&target), 5, None).await;
        assert!(matches!(result, Err(GatewayError::SizeExceeded { max: 10 })));
        assert_eq!(h.payload_files(), 0);
        assert!(h.gateway.list_objects(&alice(), "docs", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_callback_without_payload_is_not_found() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(1000)))
            .await
            .unwrap();

        let result = h.gateway.upload_callback(token_of(&target), 100, None).await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        let token = h
            .tokens
            .get_upload_token_by_token(token_of(&target))
            .await
            .unwrap();
        assert!(!token.completed);
    }

    #[tokio::test]
    async fn completed_upload_token_still_expires() {
        let h = TestHarness::with_ttl(Duration::from_secs(1)).await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let target = h
            .gateway
            .issue_upload_target(&alice(), &h.snapshot(), pdf_request("docs", Some(1000)))
            .await
            .unwrap();
        stage_payload(&h, &target, b"hello").await;
        h.gateway
            .upload_callback(token_of(&target), 5, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(matches!(
            h.gateway.upload_callback(token_of(&target), 5, None).await,
            Err(GatewayError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn completed_download_token_still_expires() {
        let h = TestHarness::with_ttl(Duration::from_secs(1)).await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let object = h.upload(&alice(), "docs", "a.txt", b"abcdef").await;
        let target = h
            .gateway
            .issue_download_target(&alice(), &h.snapshot(), "docs", object.id)
            .await
            .unwrap();
        h.gateway
            .download_callback(token_of(&target), 6, true)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(matches!(
            h.gateway.download_callback(token_of(&target), 6, true).await,
            Err(GatewayError::TokenExpired)
        ));
        assert!(matches!(
            h.gateway
                .open_direct_download(token_of(&target), &h.snapshot())
                .await,
            Err(GatewayError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn expired_download_token_cannot_open_a_stream() {
        let h = TestHarness::with_ttl(Duration::from_secs(0)).await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let object = h.upload(&alice(), "docs", "a.txt", b"abcdef").await;
        let target = h
            .gateway
            .issue_download_target(&alice(), &h.snapshot(), "docs", object.id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(matches!(
            h.gateway
                .open_direct_download(token_of(&target), &h.snapshot())
                .await,
            Err(GatewayError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn one_download_token_grants_one_stream() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let object = h.upload(&alice(), "docs", "data.bin", &[4u8; 1000]).await;
        let target = h
            .gateway
            .issue_download_target(&alice(), &h.snapshot(), "docs", object.id)
            .await
            .unwrap();

        let first = h
            .gateway
            .open_direct_download(token_of(&target), &h.snapshot())
            .await
            .unwrap();
        let second = h
            .gateway
            .open_direct_download(token_of(&target), &h.snapshot())
            .await;
        assert!(matches!(second, Err(GatewayError::AlreadyCompleted)));

        assert_eq!(read_all(first.body).await.len(), 1000);
        let token = h.wait_for_download(token_of(&target)).await;
        assert_eq!(token.bytes_served, 1000);
    }

    #[tokio::test]
    async fn same_name_in_user_files_is_per_owner() {
        let h = TestHarness::new().await;
        let alices = h.upload(&alice(), "user-files", "report.pdf", b"alice's").await;
        let bobs = h.upload(&bob(), "user-files", "report.pdf", b"bob's").await;
        assert_ne!(alices.id, bobs.id);

        let listed = h.gateway.list_objects(&bob(), "user-files", None).await.unwrap();
        assert_eq!(listed.iter().map(|o| o.id).collect::<Vec<_>>(), vec![bobs.id]);

        let target = h
            .gateway
            .issue_upload_target(&bob(), &h.snapshot(), pdf_request("user-files", None))
            .await;
        assert!(matches!(target, Err(GatewayError::AlreadyExists(_))));
        let carol = CallerIdentity {
            user_id: "carol".into(),
            app_id: None,
            roles: Vec::new(),
        };
        h.gateway
            .issue_upload_target(&carol, &h.snapshot(), pdf_request("user-files", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn download_callback_tracks_progress_then_completes() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let object = h.upload(&alice(), "docs", "a.txt", b"abcdef").await;
        let target = h
            .gateway
            .issue_download_target(&alice(), &h.snapshot(), "docs", object.id)
            .await
            .unwrap();

        let partial = h
            .gateway
            .download_callback(token_of(&target), 3, false)
            .await
            .unwrap();
        assert!(!partial.completed);
        let done = h
            .gateway
            .download_callback(token_of(&target), 6, true)
            .await
            .unwrap();
        assert!(done.completed);
        assert_eq!(done.bytes_served, 6);
        assert!(matches!(
            h.gateway.download_callback(token_of(&target), 6, true).await,
            Err(GatewayError::AlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn deleting_folder_removes_subtree_and_payloads() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let top = h.gateway.create_folder(&alice(), "docs", "top", None).await.unwrap();
        let nested = h
            .gateway
            .create_folder(&alice(), "docs", "nested", Some(top.id))
            .await
            .unwrap();
        h.upload_into(&alice(), "docs", Some(nested.id), "deep.txt", b"deep").await;
        h.upload_into(&alice(), "docs", Some(top.id), "shallow.txt", b"shallow").await;
        assert_eq!(h.payload_files(), 2);

        h.gateway.delete_object(&alice(), "docs", top.id).await.unwrap();
        assert!(h.gateway.list_objects(&alice(), "docs", None).await.unwrap().is_empty());
        assert_eq!(h.payload_files(), 0);
    }

    #[tokio::test]
    async fn bucket_delete_requires_cascade_when_not_empty() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let folder = h.gateway.create_folder(&alice(), "docs", "f", None).await.unwrap();
        h.upload_into(&alice(), "docs", Some(folder.id), "x.txt", b"x").await;

        assert!(matches!(
            h.gateway.delete_bucket(&alice(), "docs", false).await,
            Err(GatewayError::NotEmpty(_))
        ));
        assert!(matches!(
            h.gateway.delete_bucket(&bob(), "docs", true).await,
            Err(GatewayError::AccessDenied(_))
        ));
        h.gateway.delete_bucket(&alice(), "docs", true).await.unwrap();
        assert!(h.gateway.list_buckets().await.unwrap().iter().all(|b| b.name != "docs"));
        assert_eq!(h.payload_files(), 0);
    }

    #[tokio::test]
    async fn duplicate_names_conflict_before_bytes_move() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        h.upload(&alice(), "docs", "same.txt", b"one").await;
        let err = h
            .gateway
            .issue_upload_target(
                &alice(),
                &h.snapshot(),
                UploadUrlRequest {
                    filename: "same.txt".into(),
                    ..pdf_request("docs", None)
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn rename_and_metadata_require_ownership() {
        let h = TestHarness::new().await;
        h.gateway.create_bucket(&alice(), "docs", false).await.unwrap();
        let object = h.upload(&alice(), "docs", "draft.txt", b"x").await;

        let renamed = h
            .gateway
            .rename_object(&alice(), "docs", object.id, "final.txt")
            .await
            .unwrap();
        assert_eq!(renamed.name, "final.txt");
        let tagged = h
            .gateway
            .update_metadata(&alice(), "docs", object.id, &json!({"tag": "v1"}))
            .await
            .unwrap();
        assert_eq!(tagged.metadata.0["tag"], "v1");

        assert!(matches!(
            h.gateway
                .rename_object(&bob(), "docs", object.id, "stolen.txt")
                .await,
            Err(GatewayError::AccessDenied(_))
        ));
        assert!(matches!(
            h.gateway
                .update_metadata(&alice(), "docs", object.id, &json!([1, 2]))
                .await,
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn stats_are_admin_only() {
        let h = TestHarness::new().await;
        let stats = h.gateway.stats(&alice()).await.unwrap();
        assert_eq!(stats.provider, ProviderKind::Local);
        assert!(matches!(
            h.gateway.stats(&bob()).await,
            Err(GatewayError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn post_login_reaches_hooks() {
        let h = TestHarness::new().await;
        h.gateway.post_login(&bob(), &h.snapshot());
        h.wait_for_hooks(1).await;
    }

    #[test]
    fn aliases_resolve_user_files() {
        let aliases = BucketAliases::new("int_storage");
        assert_eq!(aliases.resolve("user-files"), "int_storage");
        assert_eq!(aliases.resolve("docs"), "docs");
        assert!(aliases.is_internal("user-files"));
        assert!(aliases.is_internal("int_storage"));
        assert!(!aliases.is_internal("docs"));
    }

    #[test]
    fn bucket_names_follow_s3_rules() {
        for ok in ["docs", "my-bucket.v2", "abc"] {
            assert!(validate_bucket_name(ok).is_ok(), "{ok}");
        }
        for bad in ["ab", "Docs", "-docs", "a..b", "192.168.0.1", "under_score"] {
            assert!(validate_bucket_name(bad).is_err(), "{bad}");
        }
    }
}
