//! Periodic List+compare pass.
//!
//! Watches can miss events across reconnects and the syncer may have been
//! down while objects changed. The sweeper lists both clusters, compares
//! them against the snapshots, and hands every key that looks out of step
//! to the controller. It never writes; the controller and engine do the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vsync_common::metrics::SWEEP_FAILURES_TOTAL;
use vsync_common::{ObjectKey, Result};

use crate::client::ListFilter;
use crate::controller::Requeue;
use crate::descriptor::KindDescriptor;
use crate::engine::SyncEngine;
use crate::translator::TranslateContext;

/// What one sweep saw and did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Virtual objects listed
    pub listed_virtual: usize,
    /// Managed host objects listed
    pub listed_host: usize,
    /// Keys enqueued
    pub enqueued: usize,
    /// Host objects that could not be mapped to a key
    pub failures: usize,
}

/// Background sweep for one kind
pub struct Sweeper {
    descriptor: Arc<KindDescriptor>,
    engine: Arc<SyncEngine>,
    requeue: Requeue,
}

impl Sweeper {
    /// Sweeper scheduling reconciles through `requeue`
    pub fn new(descriptor: Arc<KindDescriptor>, engine: Arc<SyncEngine>, requeue: Requeue) -> Self {
        Self {
            descriptor,
            engine,
            requeue,
        }
    }

    /// List both clusters once and enqueue keys that need a reconcile
    ///
    /// A key is enqueued when only one side exists, when either side differs
    /// from its snapshot, or when no snapshot exists yet. Listing failures
    /// abort the sweep; per-object mapping failures are counted and skipped.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let descriptor = &self.descriptor;
        let kind = descriptor.kind_key();
        let ctx = TranslateContext::new(descriptor, self.engine.metadata());
        let snapshots = self.engine.snapshots();
        let mut report = SweepReport::default();

        let virtual_objects = self
            .engine
            .virtual_client()
            .list(&descriptor.api_resource, &ListFilter::default())
            .await?;
        let host_objects = self
            .engine
            .host_client()
            .list(&descriptor.api_resource, &self.engine.host_filter(descriptor))
            .await?;
        report.listed_virtual = virtual_objects.len();

        let mut host_by_key = BTreeMap::new();
        for host in host_objects {
            if !self.engine.is_managed(descriptor, &host) {
                continue;
            }
            report.listed_host += 1;
            match descriptor
                .translator
                .virtual_key(&ctx, &host, self.engine.host_client().as_ref())
                .await
            {
                Ok(Some(key)) => {
                    host_by_key.insert(key, host);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(kind = %kind, host = %host.name_any(), error = %e, "sweep could not map host object");
                    report.failures += 1;
                }
            }
        }

        let mut dirty = BTreeSet::new();
        for obj in &virtual_objects {
            let key = ObjectKey::from_object(obj);
            let host = host_by_key.get(&key);
            let in_step = host.is_some()
                && same_version(snapshots.virtual_object(&kind, &key).as_ref(), obj)
                && host.is_some_and(|h| same_version(snapshots.host_object(&kind, &key).as_ref(), h));
            let wanted = descriptor.sync_to_host || host.is_some();
            if !in_step && wanted {
                dirty.insert(key);
            }
        }
        let virtual_keys: BTreeSet<_> = virtual_objects.iter().map(ObjectKey::from_object).collect();
        for key in host_by_key.keys() {
            if !virtual_keys.contains(key) {
                dirty.insert(key.clone());
            }
        }

        report.enqueued = dirty.len();
        for key in dirty {
            self.requeue.now(key);
        }

        if report.failures > 0 {
            SWEEP_FAILURES_TOTAL.add(report.failures as u64, &[KeyValue::new("kind", kind.clone())]);
        }
        debug!(kind = %kind, ?report, "sweep finished");
        Ok(report)
    }

    /// Sweep every sync interval until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.engine.config().sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; the initial list is the watch's job
        interval.tick().await;
        info!(kind = %self.descriptor.kind_key(), "sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.sweep_once().await {
                warn!(kind = %self.descriptor.kind_key(), error = %e, "sweep failed");
                SWEEP_FAILURES_TOTAL.add(1, &[KeyValue::new("kind", self.descriptor.kind_key())]);
            }
        }
    }
}

fn same_version(snapshot: Option<&DynamicObject>, current: &DynamicObject) -> bool {
    snapshot.is_some_and(|s| s.resource_version() == current.resource_version())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::controller::RequeueReceiver;
    use crate::descriptor::DescriptorRegistry;
    use vsync_common::SyncConfig;

    fn setup(
        virtual_list: Vec<DynamicObject>,
        host_list: Vec<DynamicObject>,
    ) -> (Sweeper, RequeueReceiver) {
        let config = Arc::new(
            SyncConfig::builder("tenant", "team-a")
                .enabled_kinds(["v1/ConfigMap"])
                .build()
                .unwrap(),
        );
        let registry = DescriptorRegistry::from_config(&config).unwrap();
        let descriptor = registry.iter().next().unwrap().clone();

        let mut v = MockClusterClient::new();
        v.expect_list()
            .returning(move |_, _| Ok(virtual_list.clone()));
        let mut h = MockClusterClient::new();
        h.expect_list()
            .withf(|_, filter| {
                filter.namespace.as_deref() == Some("team-a")
                    && filter.label_selector.as_deref()
                        == Some("vcluster.loft.sh/managed-by=tenant")
            })
            .returning(move |_, _| Ok(host_list.clone()));

        let engine = Arc::new(SyncEngine::new(config, Arc::new(v), Arc::new(h)));
        let (requeue, rx) = Requeue::channel();
        (Sweeper::new(descriptor, engine, requeue), rx)
    }

    fn drain(rx: &mut RequeueReceiver) -> Vec<ObjectKey> {
        let mut keys = Vec::new();
        while let Ok((key, delay)) = rx.try_recv() {
            assert!(delay.is_zero());
            keys.push(key);
        }
        keys
    }

    fn cm(name: &str, rv: &str) -> DynamicObject {
        let ar = kube::api::ApiResource::erase::<k8s_openapi::api::core::v1::ConfigMap>(&());
        let mut obj = DynamicObject::new(name, &ar);
        obj.metadata.namespace = Some("prod".to_string());
        obj.metadata.uid = Some(format!("{name}-uid"));
        obj.metadata.resource_version = Some(rv.to_string());
        obj
    }

    #[tokio::test]
    async fn virtual_objects_without_host_counterpart_are_enqueued() {
        let (sweeper, mut rx) = setup(vec![cm("a", "1"), cm("b", "1")], vec![]);
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.listed_virtual, 2);
        assert_eq!(report.enqueued, 2);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    /// Story: the syncer was down while a tenant deleted a ConfigMap. The
    /// orphaned host object is found on the next sweep.
    #[tokio::test]
    async fn story_orphaned_host_object_is_found() {
        let (helper, _) = setup(vec![], vec![]);
        let ctx = TranslateContext::new(&helper.descriptor, helper.engine.metadata());
        let host = helper
            .descriptor
            .translator
            .to_host(&ctx, &cm("gone", "3"))
            .unwrap();

        let (sweeper, mut rx) = setup(vec![], vec![host]);
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.listed_host, 1);
        assert_eq!(drain(&mut rx), vec![ObjectKey::namespaced("prod", "gone")]);
    }

    #[tokio::test]
    async fn converged_pairs_are_left_alone() {
        let virtual_obj = cm("a", "7");
        let (helper, _) = setup(vec![], vec![]);
        let ctx = TranslateContext::new(&helper.descriptor, helper.engine.metadata());
        let mut host = helper.descriptor.translator.to_host(&ctx, &virtual_obj).unwrap();
        host.metadata.resource_version = Some("70".to_string());

        let (sweeper, mut rx) = setup(vec![virtual_obj.clone()], vec![host.clone()]);
        let kind = sweeper.descriptor.kind_key();
        let key = ObjectKey::namespaced("prod", "a");
        sweeper.engine.snapshots().record_virtual(&kind, &key, &virtual_obj);
        sweeper.engine.snapshots().record_host(&kind, &key, &host);

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.enqueued, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn foreign_host_objects_are_ignored() {
        let mut foreign = cm("other", "1");
        foreign.metadata.namespace = Some("team-a".to_string());
        let (sweeper, mut rx) = setup(vec![], vec![foreign]);
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.listed_host, 0);
        assert!(drain(&mut rx).is_empty());
    }
}
