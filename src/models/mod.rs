//! Core data models for the transfer gateway.
//!
//! Buckets and objects describe the logical file tree; upload and download
//! tokens describe single transfers brokered against that tree. All of them
//! map to SQLite rows via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod bucket;
pub mod object;
pub mod token;
