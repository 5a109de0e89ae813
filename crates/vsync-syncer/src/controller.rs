//! Per-kind controller built on `kube::runtime::Controller`.
//!
//! The controller watches the virtual kind itself. Host objects are filtered
//! through the ownership check and mapped back to the virtual key they belong
//! to, then fed in with `reconcile_on`, so both sides of a pair trigger the
//! same reconcile and kube's runner keeps it single-flight per key.
//!
//! Keys whose virtual object is absent never reach the reconciler; the run
//! stream reports them as `ObjectNotFound` and they are reconciled from the
//! output side instead.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::{Action, Config as ControllerConfig, Error as ControllerError};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::Controller;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vsync_common::retry::{jittered, RetryConfig};
use vsync_common::{ObjectKey, Result};

use crate::cache::{object_ref, ReadCache};
use crate::descriptor::KindDescriptor;
use crate::engine::{SyncEngine, SyncOutcome};
use crate::translator::TranslateContext;

/// Stream of objects touched on one cluster
pub type ObjectStream = BoxStream<'static, DynamicObject>;

/// Delay for outcomes that want another pass right away
///
/// Long enough for a watch event carrying the write to reach the cache.
const IMMEDIATE_REQUEUE: Duration = Duration::from_millis(50);

/// Delayed triggers waiting at once before the channel stops being drained
const MAX_PENDING_TRIGGERS: usize = 4096;

/// Handle for scheduling reconciles of a key from outside the controller
#[derive(Clone)]
pub struct Requeue {
    tx: mpsc::UnboundedSender<(ObjectKey, Duration)>,
}

/// Receiving end of a [`Requeue`] handle
pub type RequeueReceiver = mpsc::UnboundedReceiver<(ObjectKey, Duration)>;

impl Requeue {
    /// New handle and the receiver the controller drains
    pub fn channel() -> (Self, RequeueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reconcile `key` as soon as possible
    pub fn now(&self, key: ObjectKey) {
        self.after(key, Duration::ZERO);
    }

    /// Reconcile `key` once `delay` has passed
    pub fn after(&self, key: ObjectKey, delay: Duration) {
        if self.tx.send((key, delay)).is_err() {
            debug!("controller stopped, dropping requeue");
        }
    }
}

/// Delay before the next pass for an engine outcome, `None` when the key is converged
pub fn requeue_delay(outcome: SyncOutcome) -> Option<Duration> {
    match outcome {
        SyncOutcome::Done => None,
        SyncOutcome::RequeueNow => Some(IMMEDIATE_REQUEUE),
        SyncOutcome::RequeueAfter(delay) => Some(delay),
    }
}

fn action(delay: Option<Duration>) -> Action {
    match delay {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

/// State shared by every reconcile of one kind
pub struct KindContext {
    descriptor: Arc<KindDescriptor>,
    engine: Arc<SyncEngine>,
    caches: Vec<Arc<ReadCache>>,
    requeue: Requeue,
    backoff: RetryConfig,
    failures: DashMap<ObjectKey, u32>,
    orphans: DashSet<ObjectKey>,
}

impl KindContext {
    /// Kind handled by this context
    pub fn descriptor(&self) -> &Arc<KindDescriptor> {
        &self.descriptor
    }

    /// Reconcile `key` once every cache has synced
    ///
    /// Returns the delay before the next pass. A success clears the key's
    /// failure count.
    pub async fn sync_key(&self, key: &ObjectKey) -> Result<Option<Duration>> {
        let timeout = self.engine.config().cache_sync_timeout();
        for cache in &self.caches {
            cache.wait_until_synced(timeout).await?;
        }
        let outcome = self.engine.reconcile(&self.descriptor, key).await?;
        self.failures.remove(key);
        Ok(requeue_delay(outcome))
    }

    /// Backoff for the next attempt after `key` failed again
    pub fn failure_backoff(&self, key: &ObjectKey) -> Duration {
        let attempts = {
            let mut count = self.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        jittered(self.backoff.delay_for_attempt(attempts))
    }

    /// Consecutive failures recorded for `key`
    pub fn failure_count(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).map_or(0, |count| *count)
    }

    /// Store reference of the virtual object a host object belongs to
    ///
    /// Foreign host objects and objects that map to no virtual key yield `None`.
    pub async fn host_trigger(&self, host: &DynamicObject) -> Option<ObjectRef<DynamicObject>> {
        if !self.engine.is_managed(&self.descriptor, host) {
            return None;
        }
        let ctx = TranslateContext::new(&self.descriptor, self.engine.metadata());
        match self
            .descriptor
            .translator
            .virtual_key(&ctx, host, self.engine.host_client().as_ref())
            .await
        {
            Ok(Some(key)) => Some(object_ref(&self.descriptor.api_resource, &key)),
            Ok(None) => {
                debug!(host = %host.name_any(), "host object maps to no virtual object");
                None
            }
            Err(e) => {
                warn!(host = %host.name_any(), error = %e, "failed to map host object");
                None
            }
        }
    }

    /// Reconcile a key whose virtual object is not in the store
    pub async fn sync_orphan(&self, key: ObjectKey) {
        if !self.orphans.insert(key.clone()) {
            self.requeue.after(key, IMMEDIATE_REQUEUE);
            return;
        }
        let delay = match self.sync_key(&key).await {
            Ok(delay) => delay,
            Err(e) => {
                error!(
                    kind = %self.descriptor.gvk.kind,
                    object = %key,
                    error = %e,
                    retryable = e.is_retryable(),
                    "reconcile failed"
                );
                Some(self.failure_backoff(&key))
            }
        };
        self.orphans.remove(&key);
        if let Some(delay) = delay {
            self.requeue.after(key, delay);
        }
    }

    async fn handle_result<Q>(
        &self,
        result: std::result::Result<
            (ObjectRef<DynamicObject>, Action),
            ControllerError<vsync_common::Error, Q>,
        >,
    ) where
        Q: std::error::Error + 'static,
    {
        match result {
            Ok((obj_ref, action)) => debug!(object = %obj_ref, ?action, "reconciled"),
            Err(ControllerError::ObjectNotFound(obj_ref)) => {
                let key = match obj_ref.namespace {
                    Some(ns) => ObjectKey::namespaced(ns, obj_ref.name),
                    None => ObjectKey::cluster(obj_ref.name),
                };
                self.sync_orphan(key).await;
            }
            Err(ControllerError::ReconcilerFailed(_, obj_ref)) => {
                debug!(object = %obj_ref, "reconcile failed, backing off");
            }
            Err(e) => warn!(kind = %self.descriptor.gvk.kind, error = %e, "controller error"),
        }
    }
}

async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<KindContext>) -> Result<Action> {
    let key = ObjectKey::from_object(&obj);
    ctx.sync_key(&key).await.map(action)
}

fn error_policy(obj: Arc<DynamicObject>, error: &vsync_common::Error, ctx: Arc<KindContext>) -> Action {
    let key = ObjectKey::from_object(&obj);
    error!(
        kind = %ctx.descriptor.gvk.kind,
        object = %key,
        error = %error,
        retryable = error.is_retryable(),
        "reconcile failed"
    );
    Action::requeue(ctx.failure_backoff(&key))
}

/// Turn `(key, delay)` requests into store references once their delay passes
fn delayed_triggers(
    mut rx: RequeueReceiver,
    resource: ApiResource,
) -> impl Stream<Item = ObjectRef<DynamicObject>> + Send + 'static {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(move |(key, delay): (ObjectKey, Duration)| {
            let obj_ref = object_ref(&resource, &key);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                obj_ref
            }
        })
        .buffer_unordered(MAX_PENDING_TRIGGERS)
}

/// Controller for one synced kind
pub struct SyncController {
    ctx: Arc<KindContext>,
    triggers: RequeueReceiver,
}

impl SyncController {
    /// Controller reconciling `descriptor` through `engine`
    pub fn new(descriptor: Arc<KindDescriptor>, engine: Arc<SyncEngine>) -> Self {
        Self::with_caches(descriptor, engine, Vec::new())
    }

    /// Controller whose reconciles wait for `caches` to sync first
    pub fn with_caches(
        descriptor: Arc<KindDescriptor>,
        engine: Arc<SyncEngine>,
        caches: Vec<Arc<ReadCache>>,
    ) -> Self {
        let (requeue, triggers) = Requeue::channel();
        Self {
            ctx: Arc::new(KindContext {
                descriptor,
                engine,
                caches,
                requeue,
                backoff: RetryConfig::default(),
                failures: DashMap::new(),
                orphans: DashSet::new(),
            }),
            triggers,
        }
    }

    /// Shared reconcile state
    pub fn context(&self) -> &Arc<KindContext> {
        &self.ctx
    }

    /// Handle for scheduling reconciles, used by the sweeper
    pub fn requeue(&self) -> Requeue {
        self.ctx.requeue.clone()
    }

    /// Drive `controller` until `cancel` fires
    ///
    /// `controller` must watch the virtual side of this kind; `host_events`
    /// are the host objects touched by the host watch.
    pub async fn run(
        self,
        controller: Controller<DynamicObject>,
        host_events: ObjectStream,
        cancel: CancellationToken,
    ) {
        let ctx = self.ctx;
        let kind = ctx.descriptor.kind_key();
        let concurrency = ctx.engine.config().worker_count.max(1);

        let host_ctx = ctx.clone();
        let host_triggers = host_events.filter_map(move |host| {
            let ctx = host_ctx.clone();
            async move { ctx.host_trigger(&host).await }
        });
        let requeued = delayed_triggers(self.triggers, ctx.descriptor.api_resource.clone());

        let output_ctx = ctx.clone();
        let results = controller
            .with_config(
                ControllerConfig::default()
                    .concurrency(u16::try_from(concurrency).unwrap_or(u16::MAX)),
            )
            .reconcile_on(host_triggers)
            .reconcile_on(requeued)
            .run(reconcile, error_policy, ctx)
            .for_each_concurrent(concurrency, move |result| {
                let ctx = output_ctx.clone();
                async move { ctx.handle_result(result).await }
            });

        info!(kind = %kind, workers = concurrency, "starting controller");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = results => warn!(kind = %kind, "controller stream ended"),
        }
        info!(kind = %kind, "controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::descriptor::DescriptorRegistry;
    use vsync_common::{Error, SyncConfig};

    fn descriptor(config: &Arc<SyncConfig>) -> Arc<KindDescriptor> {
        let registry = DescriptorRegistry::from_config(config).unwrap();
        Arc::new(registry.get_by_kind("ConfigMap").unwrap().clone())
    }

    fn controller(virtual_client: MockClusterClient, host: MockClusterClient) -> SyncController {
        let config = Arc::new(
            SyncConfig::builder("tenant", "team-a")
                .enabled_kinds(["v1/ConfigMap"])
                .build()
                .unwrap(),
        );
        let descriptor = descriptor(&config);
        let engine = SyncEngine::new(config, Arc::new(virtual_client), Arc::new(host));
        SyncController::new(descriptor, Arc::new(engine))
    }

    fn virtual_cm(name: &str) -> DynamicObject {
        let ar = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let mut obj = DynamicObject::new(name, &ar);
        obj.metadata.namespace = Some("prod".to_string());
        obj.metadata.uid = Some(format!("{name}-uid"));
        obj
    }

    fn host_of(c: &SyncController, virtual_obj: &DynamicObject) -> DynamicObject {
        let ctx = TranslateContext::new(&c.ctx.descriptor, c.ctx.engine.metadata());
        c.ctx.descriptor.translator.to_host(&ctx, virtual_obj).unwrap()
    }

    fn unavailable() -> Error {
        Error::internal_with_context("test", "api server unavailable")
    }

    #[test]
    fn outcomes_map_to_requeue_delays() {
        assert_eq!(requeue_delay(SyncOutcome::Done), None);
        assert_eq!(requeue_delay(SyncOutcome::RequeueNow), Some(IMMEDIATE_REQUEUE));
        assert_eq!(
            requeue_delay(SyncOutcome::RequeueAfter(Duration::from_secs(30))),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn host_events_map_back_to_the_virtual_key() {
        let c = controller(MockClusterClient::new(), MockClusterClient::new());
        let host = host_of(&c, &virtual_cm("cfg"));
        let obj_ref = c.context().host_trigger(&host).await.unwrap();
        assert_eq!(obj_ref.name, "cfg");
        assert_eq!(obj_ref.namespace.as_deref(), Some("prod"));
    }

    /// Both sides of a pair resolve to the same store reference, so kube's
    /// runner deduplicates them.
    #[tokio::test]
    async fn both_sides_of_a_pair_share_one_reference() {
        let c = controller(MockClusterClient::new(), MockClusterClient::new());
        let virtual_obj = virtual_cm("cfg");
        let from_host = c.context().host_trigger(&host_of(&c, &virtual_obj)).await;
        let from_virtual = object_ref(
            &c.ctx.descriptor.api_resource,
            &ObjectKey::from_object(&virtual_obj),
        );
        assert_eq!(from_host, Some(from_virtual));
    }

    #[tokio::test]
    async fn foreign_host_objects_trigger_nothing() {
        let c = controller(MockClusterClient::new(), MockClusterClient::new());
        let mut foreign = virtual_cm("someone-elses");
        foreign.metadata.namespace = Some("team-a".to_string());
        assert!(c.context().host_trigger(&foreign).await.is_none());
    }

    #[tokio::test]
    async fn failures_back_off_and_reset_on_success() {
        let key = ObjectKey::namespaced("prod", "cfg");
        let mut v = MockClusterClient::new();
        v.expect_get().returning(|_, _| Ok(None));
        let mut h = MockClusterClient::new();
        h.expect_get().returning(|_, _| Ok(None));
        let c = controller(v, h);
        let ctx = c.context();

        let first = ctx.failure_backoff(&key);
        let _ = ctx.failure_backoff(&key);
        let third = ctx.failure_backoff(&key);
        assert_eq!(ctx.failure_count(&key), 3);
        assert!(third > first);

        assert_eq!(ctx.sync_key(&key).await.unwrap(), None);
        assert_eq!(ctx.failure_count(&key), 0);
    }

    /// Scenario: a tenant deleted an object while the API server was flaky.
    /// The orphan pass fails and is scheduled again with backoff.
    #[tokio::test]
    async fn failing_orphan_is_requeued_with_backoff() {
        let mut v = MockClusterClient::new();
        v.expect_get().returning(|_, _| Err(unavailable()));
        let mut c = controller(v, MockClusterClient::new());
        let key = ObjectKey::namespaced("prod", "gone");

        c.context().sync_orphan(key.clone()).await;
        let (requeued, delay) = c.triggers.try_recv().unwrap();
        assert_eq!(requeued, key);
        assert!(delay >= Duration::from_millis(50));
        assert_eq!(c.context().failure_count(&key), 1);
    }

    #[tokio::test]
    async fn converged_orphan_is_not_requeued() {
        let mut v = MockClusterClient::new();
        v.expect_get().returning(|_, _| Ok(None));
        let mut h = MockClusterClient::new();
        h.expect_get().returning(|_, _| Ok(None));
        let mut c = controller(v, h);

        c.context().sync_orphan(ObjectKey::namespaced("prod", "gone")).await;
        assert!(c.triggers.try_recv().is_err());
    }

    /// Reconciles never run against an unsynced cache; they fail and back off.
    #[tokio::test(start_paused = true)]
    async fn unsynced_cache_fails_the_reconcile() {
        let config = Arc::new(
            SyncConfig::builder("tenant", "team-a")
                .enabled_kinds(["v1/ConfigMap"])
                .build()
                .unwrap(),
        );
        let descriptor = descriptor(&config);
        let (cache, _writer) = ReadCache::new(descriptor.api_resource.clone());
        let engine = SyncEngine::new(
            config,
            Arc::new(MockClusterClient::new()),
            Arc::new(MockClusterClient::new()),
        );
        let c = SyncController::with_caches(descriptor, Arc::new(engine), vec![Arc::new(cache)]);

        let err = c
            .context()
            .sync_key(&ObjectKey::namespaced("prod", "cfg"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_requeues_fire_after_immediate_ones() {
        let (requeue, rx) = Requeue::channel();
        let ar = ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let mut triggers = Box::pin(delayed_triggers(rx, ar));

        requeue.after(ObjectKey::namespaced("prod", "later"), Duration::from_secs(5));
        requeue.now(ObjectKey::namespaced("prod", "first"));

        assert_eq!(triggers.next().await.unwrap().name, "first");
        assert_eq!(triggers.next().await.unwrap().name, "later");
    }
}
