//! HTTP handlers. Each one maps a request onto a gateway call and back.

pub mod bucket_handlers;
pub mod health_handlers;
pub mod object_handlers;
pub mod transfer_handlers;
pub mod usage_handlers;
