use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::services::{
    blob_store::BlobError,
    hooks::HookPoint,
    object_store::StoreError,
};

/// Failure reasons surfaced by the transfer gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication required")]
    Unauthorized,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("transfer token has expired")]
    TokenExpired,
    #[error("transfer token has already been used")]
    AlreadyCompleted,
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("payload exceeds the maximum allowed size of {max} bytes")]
    SizeExceeded { max: i64 },
    #[error("invalid parent folder: {0}")]
    InvalidParent(String),
    #[error("invalid name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("{0} is not empty")]
    NotEmpty(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The hook's own message, passed through untouched.
    #[error("{message}")]
    HookVetoed { point: HookPoint, message: String },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("storage backend error")]
    Store(#[source] sqlx::Error),
    #[error("blob storage error")]
    Blob(#[source] BlobError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => GatewayError::NotFound(what),
            StoreError::AlreadyExists(what) => GatewayError::AlreadyExists(what),
            StoreError::NotEmpty(what) => GatewayError::NotEmpty(what),
            StoreError::InvalidParent(reason) => GatewayError::InvalidParent(reason),
            StoreError::AlreadyCompleted => GatewayError::AlreadyCompleted,
            StoreError::Database(err) => GatewayError::Store(err),
        }
    }
}

impl From<BlobError> for GatewayError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(key) => GatewayError::NotFound(format!("payload `{}`", key)),
            other => GatewayError::Blob(other),
        }
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized | GatewayError::TokenExpired => StatusCode::UNAUTHORIZED,
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AlreadyCompleted | GatewayError::AlreadyExists(_) => StatusCode::CONFLICT,
            GatewayError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::InvalidParent(_)
            | GatewayError::InvalidName { .. }
            | GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::HookVetoed { point, .. } => {
                if point.is_upload() {
                    StatusCode::INSUFFICIENT_STORAGE
                } else {
                    StatusCode::FORBIDDEN
                }
            }
            GatewayError::Provider(_) => StatusCode::BAD_GATEWAY,
            GatewayError::NotEmpty(_) | GatewayError::Store(_) | GatewayError::Blob(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let status = err.status();
        match &err {
            GatewayError::Store(source) => {
                tracing::error!(error = ?source, "storage backend failure");
                AppError::internal("storage backend error")
            }
            GatewayError::Blob(source) => {
                tracing::error!(error = ?source, "blob storage failure");
                AppError::internal("blob storage error")
            }
            _ => AppError::new(status, err.to_string()),
        }
    }
}
