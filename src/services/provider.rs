//! Transfer targets: where a client should send or fetch bytes.
//!
//! Both adapters persist a token row; they differ only in the URL handed back.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use s3::Bucket;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    config::ProviderKind,
    errors::{GatewayError, GatewayResult},
    models::token::{DownloadToken, NewDownloadToken, NewUploadToken, UploadToken},
    services::token_store::TokenStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Presigned,
    Token,
}

#[derive(Clone, Debug, Serialize)]
pub struct TransferTarget {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct UploadTargetRequest {
    pub bucket: String,
    pub parent_folder_id: Option<Uuid>,
    pub object_name: String,
    pub storage_key: String,
    pub content_type: String,
    pub max_size: i64,
    pub user_id: String,
    pub app_id: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DownloadTargetRequest {
    pub object_id: Uuid,
    pub bucket: String,
    pub object_name: String,
    pub storage_key: String,
    pub file_size: i64,
    pub user_id: String,
    pub client_ip: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate_upload_target(
        &self,
        request: UploadTargetRequest,
        ttl: Duration,
    ) -> GatewayResult<(TransferTarget, UploadToken)>;

    async fn generate_download_target(
        &self,
        request: DownloadTargetRequest,
        ttl: Duration,
    ) -> GatewayResult<(TransferTarget, DownloadToken)>;
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::seconds(ttl.as_secs().min(i64::MAX as u64) as i64)
}

async fn persist_upload_token(
    tokens: &dyn TokenStore,
    request: UploadTargetRequest,
    ttl: Duration,
) -> GatewayResult<UploadToken> {
    let token = tokens
        .create_upload_token(
            NewUploadToken {
                bucket: request.bucket,
                parent_folder_id: request.parent_folder_id,
                object_name: request.object_name,
                storage_key: request.storage_key,
                user_id: request.user_id,
                app_id: request.app_id,
                max_size: request.max_size,
                content_type: request.content_type,
                client_ip: request.client_ip,
            },
            expiry(ttl),
        )
        .await?;
    Ok(token)
}

async fn persist_download_token(
    tokens: &dyn TokenStore,
    request: DownloadTargetRequest,
    ttl: Duration,
) -> GatewayResult<DownloadToken> {
    let token = tokens
        .create_download_token(
            NewDownloadToken {
                object_id: request.object_id,
                bucket: request.bucket,
                object_name: request.object_name,
                user_id: request.user_id,
                file_size: request.file_size,
                client_ip: request.client_ip,
            },
            expiry(ttl),
        )
        .await?;
    Ok(token)
}

/// Bytes flow through this service's own direct endpoints.
pub struct LocalTokenProvider {
    tokens: Arc<dyn TokenStore>,
    base_url: String,
}

impl LocalTokenProvider {
    /// `base_url` prefixes generated links; empty yields root-relative paths.
    pub fn new(tokens: Arc<dyn TokenStore>, base_url: impl Into<String>) -> Self {
        Self {
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for LocalTokenProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn generate_upload_target(
        &self,
        request: UploadTargetRequest,
        ttl: Duration,
    ) -> GatewayResult<(TransferTarget, UploadToken)> {
        let token = persist_upload_token(self.tokens.as_ref(), request, ttl).await?;
        let target = TransferTarget {
            url: format!("{}/storage/direct-upload/{}", self.base_url, token.token),
            kind: TargetKind::Token,
            expires_in: ttl.as_secs(),
            callback_url: None,
        };
        Ok((target, token))
    }

    async fn generate_download_target(
        &self,
        request: DownloadTargetRequest,
        ttl: Duration,
    ) -> GatewayResult<(TransferTarget, DownloadToken)> {
        let token = persist_download_token(self.tokens.as_ref(), request, ttl).await?;
        let target = TransferTarget {
            url: format!("{}/storage/direct/{}", self.base_url, token.token),
            kind: TargetKind::Token,
            expires_in: ttl.as_secs(),
            callback_url: None,
        };
        Ok((target, token))
    }
}

/// Bytes flow straight to the S3-compatible service through signed URLs.
pub struct RemotePresignedProvider {
    tokens: Arc<dyn TokenStore>,
    bucket: Box<Bucket>,
    callback_base: String,
}

impl RemotePresignedProvider {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        bucket: Box<Bucket>,
        callback_base: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            bucket,
            callback_base: callback_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn presign_secs(ttl: Duration) -> u32 {
        ttl.as_secs().clamp(1, u32::MAX as u64) as u32
    }
}

#[async_trait]
impl ProviderAdapter for RemotePresignedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    async fn generate_upload_target(
        &self,
        request: UploadTargetRequest,
        ttl: Duration,
    ) -> GatewayResult<(TransferTarget, UploadToken)> {
        let url = self
            .bucket
            .presign_put(&request.storage_key, Self::presign_secs(ttl), None, None)
            .await
            .map_err(|e| {
                GatewayError::Provider(format!("failed to presign upload: {}", e))
            })?;
        let token = persist_upload_token(self.tokens.as_ref(), request, ttl).await?;
        let target = TransferTarget {
            url,
            kind: TargetKind::Presigned,
            expires_in: ttl.as_secs(),
            callback_url: Some(format!(
                "{}/storage/upload-callback/{}",
                self.callback_base, token.token
            )),
        };
        Ok((target, token))
    }

    async fn generate_download_target(
        &self,
        request: DownloadTargetRequest,
        ttl: Duration,
    ) -> GatewayResult<(TransferTarget, DownloadToken)> {
        let url = self
            .bucket
            .presign_get(&request.storage_key, Self::presign_secs(ttl), None)
            .await
            .map_err(|e| {
                GatewayError::Provider(format!("failed to presign download: {}", e))
            })?;
        let token = persist_download_token(self.tokens.as_ref(), request, ttl).await?;
        let target = TransferTarget {
            url,
            kind: TargetKind::Presigned,
            expires_in: ttl.as_secs(),
            callback_url: Some(format!(
                "{}/storage/download-callback/{}",
                self.callback_base, token.token
            )),
        };
        Ok((target, token))
    }
}
