//! Bucket administration.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::{auth::CallerIdentity, errors::AppError, services::gateway::TransferGateway};

#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    pub name: String,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteBucketQuery {
    #[serde(default)]
    pub cascade: bool,
}

/// `POST /storage/buckets`
pub async fn create_bucket(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Json(req): Json<CreateBucketReq>,
) -> Result<impl IntoResponse, AppError> {
    let bucket = gateway.create_bucket(&caller, &req.name, req.public).await?;
    Ok((StatusCode::CREATED, Json(json!({ "name": bucket.name }))))
}

/// `GET /storage/buckets`
pub async fn list_buckets(
    State(gateway): State<TransferGateway>,
    _caller: CallerIdentity,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(gateway.list_buckets().await?))
}

/// `DELETE /storage/buckets/{bucket}?cascade=bool`
pub async fn delete_bucket(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    Path(bucket): Path<String>,
    Query(query): Query<DeleteBucketQuery>,
) -> Result<impl IntoResponse, AppError> {
    gateway.delete_bucket(&caller, &bucket, query.cascade).await?;
    Ok(Json(json!({ "deleted": bucket })))
}
