//! In-memory cluster for scenario tests
//!
//! Behaves like the API server where the engine cares: resource versions
//! bump on every write, patches carrying a stale resource version conflict,
//! deletes honor UID preconditions and finalizers, and creates of existing
//! names fail with AlreadyExists.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject};
use kube::error::ErrorResponse;
use kube::ResourceExt;
use serde_json::Value;
use vsync_common::{Error, ObjectKey, Result, SyncConfig};
use vsync_syncer::cache::resource_key;
use vsync_syncer::client::{ClusterClient, DeleteOptions, ListFilter};
use vsync_syncer::json::apply_merge_patch;
use vsync_syncer::{
    DescriptorRegistry, KindDescriptor, SharedServiceAllocator, SyncEngine, SyncOutcome,
};

type StoreKey = (String, Option<String>, String);

/// One fake cluster
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<StoreKey, DynamicObject>>,
    revision: AtomicU64,
    writes: Mutex<Vec<String>>,
    service_ips: AtomicBool,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand out cluster IPs to Services on create, like the service controller
    pub fn assign_service_ips(&self) {
        self.service_ips.store(true, Ordering::SeqCst);
    }

    fn store_key(resource: &ApiResource, key: &ObjectKey) -> StoreKey {
        (resource_key(resource), key.namespace.clone(), key.name.clone())
    }

    fn bump(&self, obj: &mut DynamicObject) {
        let rv = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(rv.to_string());
    }

    fn log(&self, entry: String) {
        self.writes.lock().unwrap().push(entry);
    }

    /// Store an object as if a third party created it
    pub fn seed(&self, resource: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", self.revision.load(Ordering::SeqCst) + 1));
        }
        self.bump(&mut obj);
        let key = Self::store_key(resource, &ObjectKey::from_object(&obj));
        self.objects.lock().unwrap().insert(key, obj.clone());
        obj
    }

    /// Edit a stored object out of band
    pub fn edit(&self, resource: &ApiResource, key: &ObjectKey, edit: impl FnOnce(&mut DynamicObject)) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&Self::store_key(resource, key))
            .expect("object to edit exists");
        edit(obj);
        let rv = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(rv.to_string());
    }

    /// Remove an object out of band, ignoring finalizers
    pub fn remove(&self, resource: &ApiResource, key: &ObjectKey) {
        self.objects
            .lock()
            .unwrap()
            .remove(&Self::store_key(resource, key));
    }

    pub fn object(&self, resource: &ApiResource, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::store_key(resource, key))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Writes so far, as `verb namespace/name`
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn patch_object(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
        status_only: bool,
    ) -> Result<DynamicObject> {
        let mut objects = self.objects.lock().unwrap();
        let store_key = Self::store_key(resource, key);
        let Some(current) = objects.get(&store_key).cloned() else {
            return Err(api_error(404, "NotFound"));
        };

        let mut patch = patch.clone();
        if let Some(rv) = patch
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .and_then(|m| m.remove("resourceVersion"))
        {
            if rv.as_str() != current.metadata.resource_version.as_deref() {
                return Err(api_error(409, "Conflict"));
            }
        }
        if status_only {
            patch = match patch.get("status") {
                Some(status) => serde_json::json!({ "status": status }),
                None => serde_json::json!({}),
            };
        }

        let mut value = serde_json::to_value(&current)?;
        apply_merge_patch(&mut value, &patch);
        let mut updated: DynamicObject = serde_json::from_value(value)?;
        self.bump(&mut updated);

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.remove(&store_key);
        } else {
            objects.insert(store_key, updated.clone());
        }
        Ok(updated)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.object(resource, key))
    }

    async fn get_live(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.object(resource, key))
    }

    async fn list(&self, resource: &ApiResource, filter: &ListFilter) -> Result<Vec<DynamicObject>> {
        let kind = resource_key(resource);
        let selector = filter
            .label_selector
            .as_deref()
            .and_then(|s| s.split_once('='));
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), _)| {
                *k == kind && (filter.namespace.is_none() || *ns == filter.namespace)
            })
            .filter(|(_, obj)| match selector {
                Some((label, value)) => obj.labels().get(label).map(String::as_str) == Some(value),
                None => true,
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_object(obj);
        let store_key = Self::store_key(resource, &key);
        if self.objects.lock().unwrap().contains_key(&store_key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut created = obj.clone();
        created.metadata.uid = None;
        if resource.kind == "Service" && self.service_ips.load(Ordering::SeqCst) {
            let ip = format!("10.96.0.{}", self.revision.load(Ordering::SeqCst) % 250 + 1);
            if let Some(spec) = created.data.get_mut("spec").and_then(Value::as_object_mut) {
                spec.entry("clusterIP").or_insert(Value::String(ip));
            }
        }
        let created = self.seed(resource, created);
        self.log(format!("create {key}"));
        Ok(created)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let updated = self.patch_object(resource, key, patch, false)?;
        self.log(format!("patch {key}"));
        Ok(updated)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let updated = self.patch_object(resource, key, patch, true)?;
        self.log(format!("status {key}"));
        Ok(updated)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        options: &DeleteOptions,
    ) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let store_key = Self::store_key(resource, key);
        let Some(current) = objects.get(&store_key).cloned() else {
            return Ok(());
        };
        if options.uid.is_some() && options.uid != current.metadata.uid {
            return Err(api_error(409, "Conflict"));
        }
        if current.finalizers().is_empty() {
            objects.remove(&store_key);
        } else if current.metadata.deletion_timestamp.is_none() {
            let mut deleting = current;
            deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            deleting.metadata.deletion_grace_period_seconds =
                options.grace_period_seconds.map(i64::from);
            let rv = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            deleting.metadata.resource_version = Some(rv.to_string());
            objects.insert(store_key, deleting);
        }
        drop(objects);
        self.log(format!("delete {key}"));
        Ok(())
    }
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (fake)"),
        reason: reason.to_string(),
        code,
    }))
}

/// Engine over two fresh fake clusters
pub struct Harness {
    pub config: Arc<SyncConfig>,
    pub registry: DescriptorRegistry,
    pub virtual_cluster: Arc<FakeCluster>,
    pub host_cluster: Arc<FakeCluster>,
    pub engine: SyncEngine,
}

impl Harness {
    pub fn new(kinds: &[&str]) -> Self {
        let config = Arc::new(
            SyncConfig::builder("tenant", "team-a")
                .enabled_kinds(kinds.iter().copied())
                .build()
                .unwrap(),
        );
        Self::with_config(config)
    }

    pub fn with_config(config: Arc<SyncConfig>) -> Self {
        let registry = DescriptorRegistry::from_config(&config).unwrap();
        let virtual_cluster = FakeCluster::new();
        let host_cluster = FakeCluster::new();
        let engine = SyncEngine::new(
            config.clone(),
            virtual_cluster.clone(),
            host_cluster.clone(),
        );
        Self {
            config,
            registry,
            virtual_cluster,
            host_cluster,
            engine,
        }
    }

    /// Report per-node Service addresses as pod host IPs
    pub fn with_node_services(mut self, selector: BTreeMap<String, String>) -> Self {
        self.host_cluster.assign_service_ips();
        let allocator = Arc::new(SharedServiceAllocator::new(
            self.config.clone(),
            self.host_cluster.clone(),
            selector,
        ));
        self.engine = self.engine.with_node_services(allocator);
        self
    }

    pub fn descriptor(&self, kind: &str) -> &KindDescriptor {
        self.registry.get_by_kind(kind).unwrap()
    }

    /// Reconcile until the engine stops asking for an immediate requeue
    pub async fn converge(&self, kind: &str, key: &ObjectKey) -> SyncOutcome {
        let descriptor = self.descriptor(kind);
        for _ in 0..10 {
            let outcome = self.engine.reconcile(descriptor, key).await.unwrap();
            if outcome != SyncOutcome::RequeueNow {
                return outcome;
            }
        }
        panic!("{key} did not settle within 10 reconciles");
    }

    /// Host key of a virtual object
    pub fn host_key(&self, kind: &str, key: &ObjectKey) -> ObjectKey {
        let descriptor = self.descriptor(kind);
        let ctx = vsync_syncer::TranslateContext::new(descriptor, self.engine.metadata());
        descriptor.translator.host_key(&ctx, key)
    }
}

pub fn object(descriptor: &KindDescriptor, namespace: &str, name: &str, data: Value) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &descriptor.api_resource);
    obj.metadata.namespace = Some(namespace.to_string());
    obj.data = data;
    obj
}
