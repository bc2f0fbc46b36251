//! Transfer lifecycle hooks.
//!
//! Before-points run inline and may veto the transfer; after-points are queued
//! onto a fixed set of workers and can never affect the response.

use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeUpload,
    AfterUpload,
    BeforeDownload,
    AfterDownload,
    PostLogin,
}

impl HookPoint {
    pub fn is_before(self) -> bool {
        matches!(self, HookPoint::BeforeUpload | HookPoint::BeforeDownload)
    }

    pub fn is_upload(self) -> bool {
        matches!(self, HookPoint::BeforeUpload | HookPoint::AfterUpload)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::BeforeUpload => "before_upload",
            HookPoint::AfterUpload => "after_upload",
            HookPoint::BeforeDownload => "before_download",
            HookPoint::AfterDownload => "after_download",
            HookPoint::PostLogin => "post_login",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the inbound request handed to hooks.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub client_ip: Option<String>,
}

/// Everything a hook may inspect. Every field is optional.
#[derive(Clone, Debug, Default, Serialize)]
pub struct HookContext {
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub bucket: Option<String>,
    pub object_id: Option<Uuid>,
    pub object_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Option<i64>,
    pub request: Option<RequestSnapshot>,
    pub response_status: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookError {
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HookError {}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, point: HookPoint, ctx: &HookContext) -> Result<(), HookError>;
}

/// Hooks per point, kept in registration order.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<HookPoint, Vec<Arc<dyn Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, point: HookPoint, hook: Arc<dyn Hook>) -> &mut Self {
        self.hooks.entry(point).or_default().push(hook);
        self
    }

    pub fn hooks_for(&self, point: HookPoint) -> &[Arc<dyn Hook>] {
        self.hooks.get(&point).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HookStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[async_trait]
pub trait HookDispatcher: Send + Sync {
    /// Run every hook for `point` in order. For before-points the first failure
    /// is returned as a veto.
    async fn execute_hooks(&self, point: HookPoint, ctx: &HookContext) -> Result<(), GatewayError>;

    /// Queue after-point hooks without waiting for them.
    fn submit_after(&self, point: HookPoint, ctx: HookContext);

    fn stats(&self) -> HookStats;
}

/// Dispatcher that accepts everything and runs nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHookDispatcher;

#[async_trait]
impl HookDispatcher for NullHookDispatcher {
    async fn execute_hooks(&self, _point: HookPoint, _ctx: &HookContext) -> Result<(), GatewayError> {
        Ok(())
    }

    fn submit_after(&self, _point: HookPoint, _ctx: HookContext) {}

    fn stats(&self) -> HookStats {
        HookStats::default()
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Job {
    point: HookPoint,
    ctx: HookContext,
}

#[derive(Clone, Copy, Debug)]
pub struct DispatcherSettings {
    pub hook_timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

/// Registry-backed dispatcher with a bounded after-hook worker pool.
pub struct RegistryDispatcher {
    registry: Arc<HookRegistry>,
    hook_timeout: Duration,
    queue: mpsc::Sender<Job>,
    counters: Arc<Counters>,
}

impl RegistryDispatcher {
    /// Spawns the worker pool; must be called inside a Tokio runtime.
    pub fn new(registry: HookRegistry, settings: DispatcherSettings) -> Self {
        let registry = Arc::new(registry);
        let counters = Arc::new(Counters::default());
        let (queue, rx) = mpsc::channel::<Job>(settings.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let hook_timeout = settings.hook_timeout;
        for worker in 0..settings.workers.max(1) {
            let registry = registry.clone();
            let counters = counters.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    let failures =
                        run_after_hooks(&registry, job.point, &job.ctx, hook_timeout).await;
                    if failures > 0 {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                debug!(worker, "hook worker stopped");
            });
        }

        Self {
            registry,
            hook_timeout: settings.hook_timeout,
            queue,
            counters,
        }
    }
}

/// Run all hooks for an after-point; failures and timeouts are logged, never
/// propagated.
async fn run_after_hooks(
    registry: &HookRegistry,
    point: HookPoint,
    ctx: &HookContext,
    hook_timeout: Duration,
) -> usize {
    let mut failures = 0;
    for hook in registry.hooks_for(point) {
        match tokio::time::timeout(hook_timeout, hook.call(point, ctx)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failures += 1;
                warn!(hook = hook.name(), point = %point, error = %err, "after-hook failed");
            }
            Err(_) => {
                failures += 1;
                warn!(hook = hook.name(), point = %point, "after-hook timed out");
            }
        }
    }
    failures
}

#[async_trait]
impl HookDispatcher for RegistryDispatcher {
    async fn execute_hooks(&self, point: HookPoint, ctx: &HookContext) -> Result<(), GatewayError> {
        if !point.is_before() {
            run_after_hooks(&self.registry, point, ctx, self.hook_timeout).await;
            return Ok(());
        }

        for hook in self.registry.hooks_for(point) {
            match tokio::time::timeout(self.hook_timeout, hook.call(point, ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(hook = hook.name(), point = %point, "hook vetoed transfer");
                    return Err(GatewayError::HookVetoed {
                        point,
                        message: err.message,
                    });
                }
                Err(_) => {
                    warn!(hook = hook.name(), point = %point, "hook timed out");
                    return Err(GatewayError::HookVetoed {
                        point,
                        message: format!("hook `{}` timed out", hook.name()),
                    });
                }
            }
        }
        Ok(())
    }

    fn submit_after(&self, point: HookPoint, ctx: HookContext) {
        if self.registry.hooks_for(point).is_empty() {
            return;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.queue.try_send(Job { point, ctx }) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(point = %point, reason = %err, "after-hook job dropped");
        }
    }

    fn stats(&self) -> HookStats {
        HookStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{Notify, mpsc as tokio_mpsc};

    type HookFn = dyn Fn(HookPoint, &HookContext) -> Result<(), HookError> + Send + Sync;

    struct FnHook {
        name: String,
        func: Box<HookFn>,
    }

    impl FnHook {
        fn new<F>(name: impl Into<String>, func: F) -> Self
        where
            F: Fn(HookPoint, &HookContext) -> Result<(), HookError> + Send + Sync + 'static,
        {
            Self {
                name: name.into(),
                func: Box::new(func),
            }
        }
    }

    #[async_trait]
    impl Hook for FnHook {
        fn name(&self) -> &str {
            &self.name
        }

        async fn call(&self, point: HookPoint, ctx: &HookContext) -> Result<(), HookError> {
            (self.func)(point, ctx)
        }
    }

    fn settings(workers: usize, queue_capacity: usize) -> DispatcherSettings {
        DispatcherSettings {
            hook_timeout: Duration::from_millis(200),
            workers,
            queue_capacity,
        }
    }

    fn recording(name: &'static str, log: Arc<StdMutex<Vec<&'static str>>>) -> Arc<dyn Hook> {
        Arc::new(FnHook::new(name, move |_, _| {
            log.lock().unwrap().push(name);
            Ok(())
        }))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    struct SlowHook;

    #[async_trait]
    impl Hook for SlowHook {
        fn name(&self) -> &str {
            "slow"
        }

        async fn call(&self, _point: HookPoint, _ctx: &HookContext) -> Result<(), HookError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    struct GateHook {
        started: tokio_mpsc::UnboundedSender<()>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Hook for GateHook {
        fn name(&self) -> &str {
            "gate"
        }

        async fn call(&self, _point: HookPoint, _ctx: &HookContext) -> Result<(), HookError> {
            let _ = self.started.send(());
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_veto_stops_remaining_hooks() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry
            .register(HookPoint::BeforeUpload, recording("first", log.clone()))
            .register(
                HookPoint::BeforeUpload,
                Arc::new(FnHook::new("quota", |_, _| Err(HookError::new("Quota exceeded")))),
            )
            .register(HookPoint::BeforeUpload, recording("never", log.clone()));
        let dispatcher = RegistryDispatcher::new(registry, settings(1, 4));

        let err = dispatcher
            .execute_hooks(HookPoint::BeforeUpload, &HookContext::default())
            .await
            .unwrap_err();
        match err {
            GatewayError::HookVetoed { point, message } => {
                assert_eq!(point, HookPoint::BeforeUpload);
                assert_eq!(message, "Quota exceeded");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn slow_before_hook_is_a_veto() {
        let mut registry = HookRegistry::new();
        registry.register(HookPoint::BeforeDownload, Arc::new(SlowHook));
        let dispatcher = RegistryDispatcher::new(registry, settings(1, 4));

        let err = dispatcher
            .execute_hooks(HookPoint::BeforeDownload, &HookContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::HookVetoed { .. }));
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn after_hooks_run_detached_and_failures_are_counted() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry
            .register(
                HookPoint::AfterUpload,
                Arc::new(FnHook::new("broken", |_, _| Err(HookError::new("nope")))),
            )
            .register(HookPoint::AfterUpload, recording("audit", log.clone()));
        let dispatcher = RegistryDispatcher::new(registry, settings(2, 8));

        dispatcher.submit_after(HookPoint::AfterUpload, HookContext::default());
        dispatcher.submit_after(HookPoint::AfterUpload, HookContext::default());
        wait_until(|| dispatcher.stats().completed == 2).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn hung_after_hook_does_not_hold_a_worker() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry
            .register(HookPoint::AfterUpload, Arc::new(SlowHook))
            .register(HookPoint::AfterUpload, recording("audit", log.clone()));
        let dispatcher = RegistryDispatcher::new(registry, settings(1, 4));

        dispatcher.submit_after(HookPoint::AfterUpload, HookContext::default());
        dispatcher.submit_after(HookPoint::AfterUpload, HookContext::default());
        wait_until(|| dispatcher.stats().completed == 2).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn full_queue_drops_jobs() {
        let (started_tx, mut started_rx) = tokio_mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let mut registry = HookRegistry::new();
        registry.register(
            HookPoint::AfterDownload,
            Arc::new(GateHook {
                started: started_tx,
                release: release.clone(),
            }),
        );
        let dispatcher = RegistryDispatcher::new(registry, settings(1, 1));

        dispatcher.submit_after(HookPoint::AfterDownload, HookContext::default());
        started_rx.recv().await.unwrap();
        dispatcher.submit_after(HookPoint::AfterDownload, HookContext::default());
        dispatcher.submit_after(HookPoint::AfterDownload, HookContext::default());

        assert_eq!(dispatcher.stats().dropped, 1);
        release.notify_one();
        started_rx.recv().await.unwrap();
        release.notify_one();
        wait_until(|| dispatcher.stats().completed == 2).await;
        assert_eq!(dispatcher.stats().submitted, 3);
    }

    #[tokio::test]
    async fn null_dispatcher_allows_everything() {
        let dispatcher = NullHookDispatcher;
        dispatcher
            .execute_hooks(HookPoint::BeforeUpload, &HookContext::default())
            .await
            .unwrap();
        dispatcher.submit_after(HookPoint::AfterUpload, HookContext::default());
        assert_eq!(dispatcher.stats(), HookStats::default());
    }

    #[test]
    fn upload_points_are_classified() {
        assert!(HookPoint::BeforeUpload.is_upload() && HookPoint::BeforeUpload.is_before());
        assert!(HookPoint::AfterUpload.is_upload() && !HookPoint::AfterUpload.is_before());
        assert!(!HookPoint::BeforeDownload.is_upload());
        assert!(!HookPoint::PostLogin.is_before());
    }
}
