//! Token-addressed transfer endpoints.
//!
//! These routes carry no bearer identity: possession of the token is the
//! credential, and the gateway checks it before any byte moves.

use crate::{
    auth::CallerIdentity,
    errors::AppError,
    services::{gateway::TransferGateway, hooks::RequestSnapshot},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Deserialize;
use std::io;

#[derive(Debug, Deserialize)]
pub struct UploadCallbackReq {
    pub size: i64,
    pub checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadCallbackReq {
    pub bytes_served: i64,
    /// Progress reports send `false`; omitted means the transfer finished.
    #[serde(default = "finished")]
    pub completed: bool,
}

fn finished() -> bool {
    true
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
}

/// Quote-safe `attachment` disposition; unusable names fall back to a bare one.
fn attachment_disposition(name: &str) -> HeaderValue {
    let ascii: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", ascii))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// `POST|PUT /storage/direct-upload/{token}`
pub async fn direct_upload(
    State(gateway): State<TransferGateway>,
    snapshot: RequestSnapshot,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let stream = body.into_data_stream().map_err(io::Error::other);

    let object = gateway
        .direct_upload(&token, &snapshot, content_length(&headers), Box::pin(stream))
        .await?;
    Ok((StatusCode::CREATED, Json(object)))
}

/// `POST /storage/upload-callback/{token}`
pub async fn upload_callback(
    State(gateway): State<TransferGateway>,
    Path(token): Path<String>,
    Json(req): Json<UploadCallbackReq>,
) -> Result<impl IntoResponse, AppError> {
    let object = gateway
        .upload_callback(&token, req.size, req.checksum)
        .await?;
    Ok(Json(object))
}

/// `GET /storage/direct/{token}`
///
/// Streams the payload as an attachment. The token is finalized once the body
/// is closed, whether the client read it all or went away.
pub async fn direct_download(
    State(gateway): State<TransferGateway>,
    snapshot: RequestSnapshot,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let download = gateway.open_direct_download(&token, &snapshot).await?;
    let object = download.object;

    let mut response = Response::new(Body::from_stream(download.body));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&object.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size.max(0)));
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&object.name),
    );
    if let Some(checksum) = object.checksum.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", checksum)) {
            headers.insert(header::ETAG, value);
        }
    }
    Ok(response)
}

/// `POST /storage/download-callback/{token}`
pub async fn download_callback(
    State(gateway): State<TransferGateway>,
    Path(token): Path<String>,
    Json(req): Json<DownloadCallbackReq>,
) -> Result<impl IntoResponse, AppError> {
    let token = gateway
        .download_callback(&token, req.bytes_served, req.completed)
        .await?;
    Ok(Json(token))
}

/// `POST /storage/post-login`
///
/// Called by the session service once a user has signed in.
pub async fn post_login(
    State(gateway): State<TransferGateway>,
    caller: CallerIdentity,
    snapshot: RequestSnapshot,
) -> impl IntoResponse {
    gateway.post_login(&caller, &snapshot);
    StatusCode::ACCEPTED
}
