//! Per-node host Services shared by every pod scheduled to the node.
//!
//! Virtual pods report their node's kubelet endpoint as a host Service in
//! the syncer's own namespace, whose cluster IP becomes the pod's host IP. Many reconciles can ask for
//! the same node's Service at once, so read-check-create runs under one lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::api::{ApiResource, DynamicObject};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;
use vsync_common::retry::{retry_retryable, RetryConfig};
use vsync_common::{Error, ObjectKey, Result, SyncConfig, MARKER_LABEL};
use vsync_translate::{safe_concat_name, NameTranslator};

use crate::client::ClusterClient;

/// Prefix of per-node Service names
pub const NODE_SERVICE_PREFIX: &str = "vsync-node";

/// Port tenants reach the node's kubelet on
pub const KUBELET_PORT: i32 = 10250;

/// Port the syncer serves the kubelet proxy on
pub const KUBELET_TARGET_PORT: i32 = 8443;

/// Label naming the node a shared Service belongs to
pub const NODE_LABEL: &str = "vcluster.loft.sh/node";

/// Allocates the per-node host Services
pub struct SharedServiceAllocator {
    config: Arc<SyncConfig>,
    names: NameTranslator,
    host_client: Arc<dyn ClusterClient>,
    lock: Mutex<()>,
    retry: RetryConfig,
    selector: BTreeMap<String, String>,
}

impl SharedServiceAllocator {
    /// Allocator creating Services that select the syncer pods via `selector`
    pub fn new(
        config: Arc<SyncConfig>,
        host_client: Arc<dyn ClusterClient>,
        selector: BTreeMap<String, String>,
    ) -> Self {
        Self {
            names: NameTranslator::new(config.clone()),
            config,
            host_client,
            lock: Mutex::new(()),
            retry: RetryConfig::with_max_attempts(5),
            selector,
        }
    }

    /// Override the retry policy for transient API failures
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Host key of the Service for `node`
    pub fn service_key(&self, node: &str) -> ObjectKey {
        let name = safe_concat_name(&[NODE_SERVICE_PREFIX, &self.names.host_name_short(node, "")]);
        ObjectKey::namespaced(self.config.current_namespace.clone(), name)
    }

    /// Return the Service for `node`, creating it if needed
    ///
    /// Concurrent callers for the same node observe exactly one create.
    pub async fn ensure_node_service(&self, node: &str) -> Result<DynamicObject> {
        let key = &self.service_key(node);
        let resource = &service_resource();
        let _guard = self.lock.lock().await;

        retry_retryable(&self.retry, "ensure_node_service", move || async move {
            if let Some(existing) = self.host_client.get_live(resource, key).await? {
                return Ok(existing);
            }
            let service = self.node_service(node, key, resource);
            match self.host_client.create(resource, &service).await {
                Ok(created) => {
                    info!(node, service = %key, "created node service");
                    Ok(created)
                }
                Err(e) if e.is_already_exists() => self
                    .host_client
                    .get_live(resource, key)
                    .await?
                    .ok_or_else(|| {
                        Error::internal_with_context(
                            "shared-service",
                            format!("service {key} vanished right after a create race"),
                        )
                    }),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// ClusterIP of the Service for `node`, once allocated
    pub async fn node_ip(&self, node: &str) -> Result<Option<String>> {
        let service = self.ensure_node_service(node).await?;
        Ok(service
            .data
            .pointer("/spec/clusterIP")
            .and_then(|ip| ip.as_str())
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .map(str::to_string))
    }

    fn node_service(&self, node: &str, key: &ObjectKey, resource: &ApiResource) -> DynamicObject {
        let mut service = DynamicObject::new(&key.name, resource);
        service.metadata.namespace = key.namespace.clone();
        service.metadata.labels = Some(BTreeMap::from([
            (MARKER_LABEL.to_string(), self.config.suffix().to_string()),
            (NODE_LABEL.to_string(), self.names.host_name_short(node, "")),
        ]));
        service.data = json!({
            "spec": {
                "selector": self.selector,
                "ports": [{
                    "name": "kubelet",
                    "port": KUBELET_PORT,
                    "targetPort": KUBELET_TARGET_PORT,
                    "protocol": "TCP",
                }],
            }
        });
        service
    }
}

fn service_resource() -> ApiResource {
    ApiResource::erase::<Service>(&())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn config() -> Arc<SyncConfig> {
        Arc::new(SyncConfig::builder("tenant", "team-a").build().unwrap())
    }

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), "vsync".to_string())])
    }

    /// Story: ten pods land on the same node at once. Only one Service is
    /// created; everyone gets the same object back.
    #[tokio::test]
    async fn story_concurrent_callers_share_one_service() {
        let store: Arc<StdMutex<Option<DynamicObject>>> = Arc::new(StdMutex::new(None));
        let creates = Arc::new(AtomicUsize::new(0));

        let mut host = MockClusterClient::new();
        let reads = store.clone();
        host.expect_get_live()
            .returning(move |_, _| Ok(reads.lock().unwrap().clone()));
        let writes = store.clone();
        let counter = creates.clone();
        host.expect_create().returning(move |_, obj| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut created = obj.clone();
            created.data["spec"]["clusterIP"] = json!("10.96.0.12");
            *writes.lock().unwrap() = Some(created.clone());
            Ok(created)
        });

        let allocator = Arc::new(SharedServiceAllocator::new(
            config(),
            Arc::new(host),
            selector(),
        ));
        let calls = (0..10).map(|_| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.node_ip("worker-1").await })
        });
        for call in futures::future::join_all(calls).await {
            assert_eq!(call.unwrap().unwrap().as_deref(), Some("10.96.0.12"));
        }
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn service_lives_in_the_syncer_namespace_with_kubelet_port() {
        let mut host = MockClusterClient::new();
        host.expect_get_live().returning(|_, _| Ok(None));
        host.expect_create()
            .withf(|_, obj| {
                obj.metadata.namespace.as_deref() == Some("team-a")
                    && obj.metadata.name.as_deref().is_some_and(|n| n.starts_with("vsync-node-"))
                    && obj.data["spec"]["ports"][0]["port"] == KUBELET_PORT
                    && obj.data["spec"]["ports"][0]["targetPort"] == KUBELET_TARGET_PORT
                    && obj.data["spec"]["selector"]["app"] == "vsync"
            })
            .times(1)
            .returning(|_, obj| Ok(obj.clone()));

        let allocator = SharedServiceAllocator::new(config(), Arc::new(host), selector());
        allocator.ensure_node_service("worker-1").await.unwrap();
    }

    #[tokio::test]
    async fn create_race_with_another_syncer_returns_the_winner() {
        let mut host = MockClusterClient::new();
        let mut seq = mockall::Sequence::new();
        host.expect_get_live()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        host.expect_create().times(1).returning(|_, _| {
            Err(Error::from(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "already exists".to_string(),
                reason: "AlreadyExists".to_string(),
                code: 409,
            })))
        });
        host.expect_get_live()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, key| {
                let mut winner = DynamicObject::new(&key.name, &service_resource());
                winner.data = json!({"spec": {"clusterIP": "10.96.0.99"}});
                Ok(Some(winner))
            });

        let allocator = SharedServiceAllocator::new(config(), Arc::new(host), selector());
        assert_eq!(
            allocator.node_ip("worker-2").await.unwrap().as_deref(),
            Some("10.96.0.99")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut host = MockClusterClient::new();
        let counter = attempts.clone();
        host.expect_get_live().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::internal("connection reset"))
            } else {
                Ok(None)
            }
        });
        host.expect_create().returning(|_, obj| Ok(obj.clone()));

        let allocator = SharedServiceAllocator::new(config(), Arc::new(host), selector())
            .with_retry(RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                ..Default::default()
            });
        allocator.ensure_node_service("worker-3").await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
