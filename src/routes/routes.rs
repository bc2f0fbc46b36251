//! Defines routes for the transfer gateway.
//!
//! ## Structure
//! - **Bucket endpoints** (bearer identity)
//!   - `POST   /storage/buckets` / `GET /storage/buckets`
//!   - `DELETE /storage/buckets/{bucket}?cascade=bool`
//!
//! - **Object endpoints** (bearer identity)
//!   - `GET    /storage/buckets/{bucket}/objects?parent_folder_id=`
//!   - `POST   /storage/buckets/{bucket}/folders`
//!   - `POST   /storage/buckets/{bucket}/upload` (multipart)
//!   - `POST   /storage/buckets/{bucket}/upload-url`
//!   - `GET    /storage/buckets/{bucket}/objects/{id}/download-url`
//!   - `GET|DELETE /storage/buckets/{bucket}/objects/{id}`
//!   - `PATCH  /storage/buckets/{bucket}/objects/{id}/rename|metadata`
//!
//! - **Token endpoints** (the token is the credential)
//!   - `POST|PUT /storage/direct-upload/{token}`, `GET /storage/direct/{token}`
//!   - `POST /storage/upload-callback/{token}`, `POST /storage/download-callback/{token}`

use crate::{
    auth::{JwtVerifier, identity_middleware},
    handlers::{
        bucket_handlers::{create_bucket, delete_bucket, list_buckets},
        health_handlers::{healthz, readyz},
        object_handlers::{
            create_folder, delete_object, download_url, get_object, list_objects, rename_object,
            update_metadata, upload_object, upload_url,
        },
        transfer_handlers::{
            direct_download, direct_upload, download_callback, post_login, upload_callback,
        },
        usage_handlers::{quota, stats},
    },
    services::gateway::TransferGateway,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request},
    middleware,
    routing::{delete, get, patch, post},
};
use std::sync::Arc;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};
use uuid::Uuid;

/// Build the router for every gateway route.
///
/// Bearer tokens are resolved into a `CallerIdentity` by `identity_middleware`;
/// the handlers that need one reject anonymous requests themselves.
pub fn routes(verifier: Arc<JwtVerifier>) -> Router<TransferGateway> {
    let buckets = Router::new()
        .route("/storage/buckets", post(create_bucket).get(list_buckets))
        .route("/storage/buckets/{bucket}", delete(delete_bucket))
        .route("/storage/buckets/{bucket}/objects", get(list_objects))
        .route("/storage/buckets/{bucket}/folders", post(create_folder))
        .route(
            "/storage/buckets/{bucket}/upload",
            post(upload_object).layer(DefaultBodyLimit::disable()),
        )
        .route("/storage/buckets/{bucket}/upload-url", post(upload_url))
        .route(
            "/storage/buckets/{bucket}/objects/{id}",
            get(get_object).delete(delete_object),
        )
        .route(
            "/storage/buckets/{bucket}/objects/{id}/download-url",
            get(download_url),
        )
        .route(
            "/storage/buckets/{bucket}/objects/{id}/rename",
            patch(rename_object),
        )
        .route(
            "/storage/buckets/{bucket}/objects/{id}/metadata",
            patch(update_metadata),
        );

    let transfers = Router::new()
        .route(
            "/storage/direct-upload/{token}",
            post(direct_upload)
                .put(direct_upload)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/storage/upload-callback/{token}", post(upload_callback))
        .route("/storage/direct/{token}", get(direct_download))
        .route("/storage/download-callback/{token}", post(download_callback));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/storage/quota", get(quota))
        .route("/storage/stats", get(stats))
        .route("/storage/post-login", post(post_login))
        .merge(buckets)
        .merge(transfers)
        .layer(middleware::from_fn_with_state(verifier, identity_middleware))
}

/// Request ID generator using UUID v7 (time-ordered)
#[derive(Clone, Copy)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Span carrying method, uri and request id.
#[derive(Clone, Debug)]
pub struct MakeSpanWithRequestId;

impl<B> tower_http::trace::MakeSpan<B> for MakeSpanWithRequestId {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");

        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// Wrap the finished router with request ids and HTTP tracing.
pub fn with_request_tracing(app: Router) -> Router {
    app.layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MakeSpanWithRequestId)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
