//! A logical bucket: the top-level namespace for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket.
///
/// Buckets are created by an administrator and can only be deleted once empty,
/// unless the caller explicitly asks the gateway to cascade.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// Unique bucket name.
    pub name: String,

    /// Public buckets allow any authenticated caller to read their objects.
    pub public: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
