//! Built-in hooks wired up from configuration.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::services::{
    hooks::{Hook, HookContext, HookError, HookPoint, HookRegistry},
    object_store::ObjectStore,
};

/// Vetoes uploads that would push a user past `quota_bytes`.
pub struct QuotaHook {
    objects: Arc<dyn ObjectStore>,
    quota_bytes: i64,
}

impl QuotaHook {
    pub fn new(objects: Arc<dyn ObjectStore>, quota_bytes: i64) -> Self {
        Self {
            objects,
            quota_bytes,
        }
    }
}

#[async_trait]
impl Hook for QuotaHook {
    fn name(&self) -> &str {
        "quota"
    }

    async fn call(&self, _point: HookPoint, ctx: &HookContext) -> Result<(), HookError> {
        let Some(user_id) = ctx.user_id.as_deref() else {
            return Ok(());
        };
        let usage = self.objects.usage_for_user(user_id).await.map_err(|err| {
            warn!(error = %err, user_id, "quota lookup failed");
            HookError::new("Quota check unavailable")
        })?;
        let declared = ctx.bytes.unwrap_or(0).max(0);
        if usage.bytes.saturating_add(declared) > self.quota_bytes {
            return Err(HookError::new("Quota exceeded"));
        }
        Ok(())
    }
}

/// Emits one structured line per completed transfer or login.
pub struct AuditHook;

#[async_trait]
impl Hook for AuditHook {
    fn name(&self) -> &str {
        "audit"
    }

    async fn call(&self, point: HookPoint, ctx: &HookContext) -> Result<(), HookError> {
        info!(
            target: "audit",
            point = %point,
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
            app_id = ctx.app_id.as_deref().unwrap_or("-"),
            bucket = ctx.bucket.as_deref().unwrap_or("-"),
            object_id = ?ctx.object_id,
            object_name = ctx.object_name.as_deref().unwrap_or("-"),
            bytes = ctx.bytes.unwrap_or(0),
            client_ip = ctx
                .request
                .as_ref()
                .and_then(|r| r.client_ip.as_deref())
                .unwrap_or("-"),
            "transfer event"
        );
        Ok(())
    }
}

/// Registry holding the hooks enabled by configuration.
pub fn builtin_registry(
    objects: Arc<dyn ObjectStore>,
    quota_bytes: Option<i64>,
    audit: bool,
) -> HookRegistry {
    let mut registry = HookRegistry::new();
    if let Some(quota) = quota_bytes {
        registry.register(HookPoint::BeforeUpload, Arc::new(QuotaHook::new(objects, quota)));
    }
    if audit {
        let audit: Arc<dyn Hook> = Arc::new(AuditHook);
        for point in [HookPoint::AfterUpload, HookPoint::AfterDownload, HookPoint::PostLogin] {
            registry.register(point, audit.clone());
        }
    }
    registry
}
