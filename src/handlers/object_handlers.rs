//! HTTP handlers for objects and folders inside a bucket.
//! Upload bodies are streamed into the gateway without buffering.

use crate::{
    auth::CallerIdentity,
    errors::AppError,
    models::object::Object,
    services::{
        gateway::{TransferGateway, UploadRequest, UploadUrlRequest},
        hooks::RequestSnapshot,
    },
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::io;
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Default, Deserialize)]
pub struct ParentQuery {
    pub parent_folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderReq {
    pub name: String,
    pub parent_folder_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlReq {
    pub filename: String,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(rename = "maxSize")]
    pub max_size: Option<i64>,
    pub parent_folder_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RenameReq {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MetadataReq {
    pub metadata: Value,
}

/// Empty and `null` select the bucket root.
fn parse_parent(raw: Option<&str>) -> Result<Option<Uuid>, AppError> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(None),
        Some(value) => Uuid::parse_str(value)
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("invalid parent_folder_id `{}`", value))),
    }
}

/// `GET /storage/buckets/{bucket}/objects?parent_folder_id=`
pub async fn list_objects(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Path(bucket): Path<String>,
    Query(query): Query<ParentQuery>,
) -> Result<Json<Vec<Object>>, AppError> {
    let parent = parse_parent(query.parent_folder_id.as_deref())?;
    Ok(Json(gateway.list_objects(&caller, &bucket, parent).await?))
}

/// `POST /storage/buckets/{bucket}/folders`
pub async fn create_folder(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Path(bucket): Path<String>,
    Json(req): Json<CreateFolderReq>,
) -> Result<impl IntoResponse, AppError> {
    let folder = gateway
        .create_folder(&caller, &bucket, &req.name, req.parent_folder_id)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// `POST /storage/buckets/{bucket}/upload`
///
/// Multipart form with a `file` part. `parent_folder_id` and `metadata` parts
/// are honoured when they precede `file`; the query string may carry the parent
/// as well.
pub async fn upload_object(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    snapshot: RequestSnapshot,
    Path(bucket): Path<String>,
    Query(query): Query<ParentQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut parent = parse_parent(query.parent_folder_id.as_deref())?;
    let mut metadata: Option<Value> = None;
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let part = field.name().map(str::to_string);
        match part.as_deref() {
            Some("parent_folder_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                parent = parse_parent(Some(&text))?;
            }
            Some("metadata") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| AppError::bad_request(format!("invalid metadata: {}", e)))?;
                metadata = Some(value);
            }
            Some("file") => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("file part has no filename"))?;
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                let body = field.map_err(io::Error::other);

                let object = gateway
                    .upload_stream(
                        &caller,
                        &snapshot,
                        UploadRequest {
                            bucket,
                            parent_folder_id: parent,
                            name,
                            content_type,
                            declared_size,
                            metadata,
                        },
                        Box::pin(body),
                    )
                    .await?;
                return Ok((StatusCode::CREATED, Json(object)));
            }
            _ => {}
        }
    }

    Err(AppError::bad_request("multipart body has no `file` part"))
}

/// `POST /storage/buckets/{bucket}/upload-url`
pub async fn upload_url(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    snapshot: RequestSnapshot,
    Path(bucket): Path<String>,
    Json(req): Json<UploadUrlReq>,
) -> Result<impl IntoResponse, AppError> {
    let target = gateway
        .issue_upload_target(
            &caller,
            &snapshot,
            UploadUrlRequest {
                bucket,
                filename: req.filename,
                content_type: req
                    .content_type
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                max_size: req.max_size,
                parent_folder_id: req.parent_folder_id,
            },
        )
        .await?;
    Ok(Json(target))
}

/// `GET /storage/buckets/{bucket}/objects/{id}/download-url`
pub async fn download_url(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    snapshot: RequestSnapshot,
    Path((bucket, id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let target = gateway
        .issue_download_target(&caller, &snapshot, &bucket, id)
        .await?;
    Ok(Json(target))
}

/// `GET /storage/buckets/{bucket}/objects/{id}`
pub async fn get_object(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Path((bucket, id)): Path<(String, Uuid)>,
) -> Result<Json<Object>, AppError> {
    Ok(Json(gateway.get_object(&caller, &bucket, id).await?))
}

/// `DELETE /storage/buckets/{bucket}/objects/{id}`
pub async fn delete_object(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Path((bucket, id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    gateway.delete_object(&caller, &bucket, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PATCH /storage/buckets/{bucket}/objects/{id}/rename`
pub async fn rename_object(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Path((bucket, id)): Path<(String, Uuid)>,
    Json(req): Json<RenameReq>,
) -> Result<Json<Object>, AppError> {
    Ok(Json(
        gateway.rename_object(&caller, &bucket, id, &req.name).await?,
    ))
}

/// `PATCH /storage/buckets/{bucket}/objects/{id}/metadata`
pub async fn update_metadata(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Path((bucket, id)): Path<(String, Uuid)>,
    Json(req): Json<MetadataReq>,
) -> Result<Json<Object>, AppError> {
    Ok(Json(
        gateway
            .update_metadata(&caller, &bucket, id, &req.metadata)
            .await?,
    ))
}
