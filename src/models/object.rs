//! Represents an object (file or folder) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, types::Json};
use uuid::Uuid;

/// Content type marking an object as a folder.
pub const FOLDER_CONTENT_TYPE: &str = "application/x-directory";

/// A single file or folder record within a bucket.
///
/// The struct stores metadata only. Payload bytes live in the blob store under
/// `storage_key`; folders have no payload and therefore no key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Display name, unique among siblings.
    pub name: String,

    /// Parent folder; `None` places the object at the bucket root.
    pub parent_folder_id: Option<Uuid>,

    /// Size in bytes.
    pub size: i64,

    /// Content type (MIME type), or the folder sentinel.
    pub content_type: String,

    /// Hex MD5 of the payload.
    pub checksum: Option<String>,

    /// Opaque caller-supplied metadata.
    pub metadata: Json<Value>,

    /// Owning user.
    pub user_id: String,

    /// Owning application, when the object was created under an app scope.
    pub app_id: Option<String>,

    /// Address of the payload in the blob store.
    #[serde(skip_serializing)]
    pub storage_key: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_viewed_at: Option<DateTime<Utc>>,
}

impl Object {
    pub fn is_folder(&self) -> bool {
        self.content_type == FOLDER_CONTENT_TYPE
    }
}

/// Fields required to insert a new object row.
#[derive(Clone, Debug)]
pub struct NewObject {
    /// Pre-allocated id; lets the payload be written before the row exists.
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub name: String,
    pub parent_folder_id: Option<Uuid>,
    pub size: i64,
    pub content_type: String,
    pub checksum: Option<String>,
    pub metadata: Value,
    pub user_id: String,
    pub app_id: Option<String>,
    pub storage_key: Option<String>,
}

impl NewObject {
    /// A folder node owned by `user_id`.
    pub fn folder(
        bucket_id: Uuid,
        name: impl Into<String>,
        parent_folder_id: Option<Uuid>,
        user_id: impl Into<String>,
        app_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bucket_id,
            name: name.into(),
            parent_folder_id,
            size: 0,
            content_type: FOLDER_CONTENT_TYPE.to_string(),
            checksum: None,
            metadata: Value::Object(Default::default()),
            user_id: user_id.into(),
            app_id,
            storage_key: None,
        }
    }
}
