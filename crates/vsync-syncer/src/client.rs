//! Uniform API access to the virtual and host clusters.
//!
//! The engine talks to both clusters through the same [`ClusterClient`]
//! trait, addressing objects by `ApiResource` + [`ObjectKey`]. The production
//! implementation wraps a `kube::Client` and can serve reads from a watch-fed
//! [`ReadCache`]; tests substitute a mock or an in-memory cluster.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    Preconditions,
};
use kube::Client;
use serde_json::Value;
use tracing::debug;
use vsync_common::{ObjectKey, Result};

#[cfg(test)]
use mockall::automock;

use crate::cache::{resource_key, ReadCache};

/// Options for a delete call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Grace period override; `None` uses the object's default
    pub grace_period_seconds: Option<u32>,
    /// Only delete if the object still has this UID
    pub uid: Option<String>,
}

impl DeleteOptions {
    /// Delete immediately, guarded by `uid`
    pub fn immediate(uid: Option<String>) -> Self {
        Self {
            grace_period_seconds: Some(0),
            uid,
        }
    }

    /// Delete with the given grace period, guarded by `uid`
    pub fn graceful(grace_period_seconds: Option<i64>, uid: Option<String>) -> Self {
        Self {
            grace_period_seconds: grace_period_seconds.and_then(|g| u32::try_from(g).ok()),
            uid,
        }
    }
}

/// Filter for list calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Restrict to one namespace
    pub namespace: Option<String>,
    /// Label selector, e.g. `vcluster.loft.sh/managed-by=tenant`
    pub label_selector: Option<String>,
}

/// Operations the engine needs on one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get an object; `Ok(None)` when it does not exist
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// Get an object bypassing any read cache
    async fn get_live(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>>;

    /// List objects
    async fn list(&self, resource: &ApiResource, filter: &ListFilter)
        -> Result<Vec<DynamicObject>>;

    /// Create an object
    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to the main resource
    async fn patch(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to the status subresource
    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject>;

    /// Delete an object; deleting an absent object succeeds
    async fn delete(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        options: &DeleteOptions,
    ) -> Result<()>;
}

/// [`ClusterClient`] backed by a `kube::Client`
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
    caches: DashMap<String, Arc<ReadCache>>,
}

impl KubeClusterClient {
    /// Create a client writing as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            caches: DashMap::new(),
        }
    }

    /// Serve reads of the cache's resource from `cache`
    pub fn attach_cache(&self, cache: Arc<ReadCache>) {
        self.caches.insert(resource_key(cache.resource()), cache);
    }

    /// Underlying kube client
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    /// Api handle for a resource, namespaced when `namespace` is set
    pub fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        if let Some(cache) = self.caches.get(&resource_key(resource)) {
            return cache.get(key);
        }
        self.get_live(resource, key).await
    }

    async fn get_live(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(resource, key.namespace.as_deref());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        filter: &ListFilter,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api(resource, filter.namespace.as_deref());
        let mut params = ListParams::default();
        if let Some(selector) = &filter.label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(resource, obj.metadata.namespace.as_deref());
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(api.create(&params, obj).await?)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let api = self.api(resource, key.namespace.as_deref());
        Ok(api
            .patch(&key.name, &self.patch_params(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let api = self.api(resource, key.namespace.as_deref());
        Ok(api
            .patch_status(&key.name, &self.patch_params(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        options: &DeleteOptions,
    ) -> Result<()> {
        let api = self.api(resource, key.namespace.as_deref());
        let params = DeleteParams {
            grace_period_seconds: options.grace_period_seconds,
            preconditions: options.uid.as_ref().map(|uid| Preconditions {
                uid: Some(uid.clone()),
                resource_version: None,
            }),
            ..Default::default()
        };
        match api.delete(&key.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(object = %key, kind = %resource.kind, "object already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
