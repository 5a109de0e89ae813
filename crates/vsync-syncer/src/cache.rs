//! Read caches and last-seen object snapshots.
//!
//! [`ReadCache`] is a reflector store: the controller's own store on the
//! virtual side, and a store fed by the host watch on the other. Reads fail until [`ReadCache::wait_until_synced`]
//! has observed the initial list, so no reconcile ever mistakes an empty,
//! still-filling cache for "object absent".
//!
//! [`SnapshotStore`] remembers the virtual and host objects the engine last
//! converged against. They are the "before" sides of the three-way merge and
//! let the engine tell an out-of-band deletion from an object it never saw.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use tracing::{debug, info};
use vsync_common::{Error, ObjectKey, Result};

/// Stable map key for an `ApiResource`
pub fn resource_key(resource: &ApiResource) -> String {
    format!("{}/{}/{}", resource.group, resource.version, resource.kind)
}

/// Store reference for the object at `key`
pub fn object_ref(resource: &ApiResource, key: &ObjectKey) -> ObjectRef<DynamicObject> {
    let obj_ref = ObjectRef::new_with(&key.name, resource.clone());
    match &key.namespace {
        Some(ns) => obj_ref.within(ns),
        None => obj_ref,
    }
}

/// Watch-fed cache of one resource on one cluster
pub struct ReadCache {
    resource: ApiResource,
    store: Store<DynamicObject>,
    synced: AtomicBool,
}

impl ReadCache {
    /// Create a cache and the writer that the watch stream must feed
    pub fn new(resource: ApiResource) -> (Self, Writer<DynamicObject>) {
        let writer = Writer::new(resource.clone());
        let store = writer.as_reader();
        (
            Self {
                resource,
                store,
                synced: AtomicBool::new(false),
            },
            writer,
        )
    }

    /// Wrap a store that an existing reflector already feeds
    pub fn from_store(resource: ApiResource, store: Store<DynamicObject>) -> Self {
        Self {
            resource,
            store,
            synced: AtomicBool::new(false),
        }
    }

    /// Resource served by this cache
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Block until the initial list has been observed, or fail after `timeout`
    pub async fn wait_until_synced(&self, timeout: Duration) -> Result<()> {
        if self.is_synced() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.store.wait_until_ready()).await {
            Ok(Ok(())) => {
                self.synced.store(true, Ordering::Release);
                info!(kind = %self.resource.kind, objects = self.store.state().len(), "cache synced");
                Ok(())
            }
            Ok(Err(_)) => Err(Error::cache(
                &self.resource.kind,
                "watch stream ended before the cache synced",
            )),
            Err(_) => Err(Error::cache(
                &self.resource.kind,
                format!("cache did not sync within {}s", timeout.as_secs()),
            )),
        }
    }

    /// Whether the sync barrier has been passed
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Cached object for `key`
    pub fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        self.ensure_synced()?;
        Ok(self
            .store
            .get(&object_ref(&self.resource, key))
            .map(|obj| (*obj).clone()))
    }

    /// Every cached object
    pub fn list(&self) -> Result<Vec<DynamicObject>> {
        self.ensure_synced()?;
        Ok(self.store.state().iter().map(|obj| (**obj).clone()).collect())
    }

    fn ensure_synced(&self) -> Result<()> {
        if self.is_synced() {
            Ok(())
        } else {
            Err(Error::cache(&self.resource.kind, "cache has not synced yet"))
        }
    }
}

/// Which side a snapshot belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SnapshotSide {
    Virtual,
    Host,
}

type SnapshotKey = (String, ObjectKey, SnapshotSide);

/// Last objects the engine converged against, per kind and virtual key
#[derive(Default)]
pub struct SnapshotStore {
    objects: DashMap<SnapshotKey, DynamicObject>,
}

impl SnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Last seen virtual object
    pub fn virtual_object(&self, kind: &str, key: &ObjectKey) -> Option<DynamicObject> {
        self.get(kind, key, SnapshotSide::Virtual)
    }

    /// Last seen host object
    pub fn host_object(&self, kind: &str, key: &ObjectKey) -> Option<DynamicObject> {
        self.get(kind, key, SnapshotSide::Host)
    }

    /// Remember the virtual object; older resource versions never replace newer ones
    pub fn record_virtual(&self, kind: &str, key: &ObjectKey, obj: &DynamicObject) {
        self.record(kind, key, SnapshotSide::Virtual, obj);
    }

    /// Remember the host object; older resource versions never replace newer ones
    pub fn record_host(&self, kind: &str, key: &ObjectKey, obj: &DynamicObject) {
        self.record(kind, key, SnapshotSide::Host, obj);
    }

    /// Drop the virtual snapshot
    pub fn forget_virtual(&self, kind: &str, key: &ObjectKey) {
        self.objects
            .remove(&(kind.to_string(), key.clone(), SnapshotSide::Virtual));
    }

    /// Drop the host snapshot
    pub fn forget_host(&self, kind: &str, key: &ObjectKey) {
        self.objects
            .remove(&(kind.to_string(), key.clone(), SnapshotSide::Host));
    }

    /// Drop both snapshots
    pub fn forget(&self, kind: &str, key: &ObjectKey) {
        self.forget_virtual(kind, key);
        self.forget_host(kind, key);
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn get(&self, kind: &str, key: &ObjectKey, side: SnapshotSide) -> Option<DynamicObject> {
        self.objects
            .get(&(kind.to_string(), key.clone(), side))
            .map(|entry| entry.value().clone())
    }

    fn record(&self, kind: &str, key: &ObjectKey, side: SnapshotSide, obj: &DynamicObject) {
        let map_key = (kind.to_string(), key.clone(), side);
        if let Some(existing) = self.objects.get(&map_key) {
            if is_newer(existing.value(), obj) {
                debug!(object = %key, ?side, "ignoring snapshot older than the stored one");
                return;
            }
        }
        self.objects.insert(map_key, obj.clone());
    }
}

/// Numeric resource version, when the server hands out integers
pub fn resource_version(obj: &DynamicObject) -> Option<u64> {
    obj.metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse().ok())
}

/// Whether `a` carries a strictly newer resource version than `b`
///
/// Resource versions are opaque; when either fails to parse as an integer
/// neither is considered newer.
pub fn is_newer(a: &DynamicObject, b: &DynamicObject) -> bool {
    match (resource_version(a), resource_version(b)) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn cm(name: &str, rv: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ApiResource::erase::<ConfigMap>(&()));
        obj.metadata.namespace = Some("default".to_string());
        obj.metadata.resource_version = Some(rv.to_string());
        obj
    }

    #[test]
    fn snapshots_never_move_backwards() {
        let store = SnapshotStore::new();
        let key = ObjectKey::namespaced("default", "cfg");
        store.record_virtual("/v1, Kind=ConfigMap", &key, &cm("cfg", "10"));
        store.record_virtual("/v1, Kind=ConfigMap", &key, &cm("cfg", "9"));
        assert_eq!(
            store
                .virtual_object("/v1, Kind=ConfigMap", &key)
                .and_then(|o| o.metadata.resource_version),
            Some("10".to_string())
        );
        store.record_virtual("/v1, Kind=ConfigMap", &key, &cm("cfg", "11"));
        assert_eq!(
            resource_version(&store.virtual_object("/v1, Kind=ConfigMap", &key).unwrap()),
            Some(11)
        );
    }

    #[test]
    fn sides_are_independent() {
        let store = SnapshotStore::new();
        let key = ObjectKey::namespaced("default", "cfg");
        store.record_host("k", &key, &cm("cfg-x-default-x-t", "3"));
        assert!(store.virtual_object("k", &key).is_none());
        assert!(store.host_object("k", &key).is_some());
        store.forget("k", &key);
        assert!(store.is_empty());
    }

    #[test]
    fn opaque_versions_are_never_newer() {
        assert!(!is_newer(&cm("a", "abc"), &cm("a", "1")));
        assert!(is_newer(&cm("a", "2"), &cm("a", "1")));
    }

    #[test]
    fn unsynced_cache_refuses_reads() {
        let (cache, _writer) = ReadCache::new(ApiResource::erase::<ConfigMap>(&()));
        assert!(!cache.is_synced());
        let err = cache
            .get(&ObjectKey::namespaced("default", "cfg"))
            .unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
        assert!(cache.list().is_err());
    }

    #[tokio::test]
    async fn wait_times_out_without_watch_data() {
        let (cache, _writer) = ReadCache::new(ApiResource::erase::<ConfigMap>(&()));
        let err = cache
            .wait_until_synced(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not sync"));
    }

    #[test]
    fn object_refs_carry_the_namespace() {
        let ar = ApiResource::erase::<ConfigMap>(&());
        let obj_ref = object_ref(&ar, &ObjectKey::namespaced("prod", "cfg"));
        assert_eq!(obj_ref.name, "cfg");
        assert_eq!(obj_ref.namespace.as_deref(), Some("prod"));
        assert_eq!(object_ref(&ar, &ObjectKey::cluster("pc")).namespace, None);
    }

    #[test]
    fn resource_key_includes_group() {
        let ar = ApiResource::erase::<ConfigMap>(&());
        assert_eq!(resource_key(&ar), "/v1/ConfigMap");
    }
}
