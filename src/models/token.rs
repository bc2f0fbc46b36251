//! Upload and download tokens: single-use, time-limited transfer credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Credential brokering one upload into a bucket.
///
/// `completed` flips from false to true exactly once; afterwards the token is
/// inert. `token` is the external handle and is unrelated to `id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadToken {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub bucket: String,
    pub parent_folder_id: Option<Uuid>,
    pub object_name: String,
    /// Blob address reserved for the payload before any byte arrives.
    #[serde(skip_serializing)]
    pub storage_key: String,
    pub user_id: String,
    pub app_id: Option<String>,
    pub max_size: i64,
    pub content_type: String,
    pub bytes_uploaded: i64,
    pub completed: bool,
    pub object_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub client_ip: Option<String>,
}

impl UploadToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Credential brokering one streamed read of an object.
///
/// `started` is claimed once, when a gateway stream opens; `completed` is
/// set when that stream (or a provider callback) reports the bytes served.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DownloadToken {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub object_id: Uuid,
    pub bucket: String,
    pub object_name: String,
    pub user_id: String,
    pub file_size: i64,
    pub bytes_served: i64,
    pub started: bool,
    pub completed: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub client_ip: Option<String>,
}

impl DownloadToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Fields required to issue an upload token.
#[derive(Clone, Debug)]
pub struct NewUploadToken {
    pub bucket: String,
    pub parent_folder_id: Option<Uuid>,
    pub object_name: String,
    pub storage_key: String,
    pub user_id: String,
    pub app_id: Option<String>,
    pub max_size: i64,
    pub content_type: String,
    pub client_ip: Option<String>,
}

/// Fields required to issue a download token.
#[derive(Clone, Debug)]
pub struct NewDownloadToken {
    pub object_id: Uuid,
    pub bucket: String,
    pub object_name: String,
    pub user_id: String,
    pub file_size: i64,
    pub client_ip: Option<String>,
}
