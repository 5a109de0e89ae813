//! Kind descriptors and the registry built from configuration.
//!
//! Each synced kind is described once: its API coordinates, scope, sync
//! direction, status handling, back-synced fields, ownership policy and
//! translator. The engine is generic over descriptors and never inspects
//! concrete object types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{ApiResource, GroupVersionKind};
use kube::discovery::Scope;
use vsync_common::{Error, Result, SyncConfig};
use vsync_translate::{gvk_string, OwnershipPolicy};

use crate::translator::{EventTranslator, GenericTranslator, KindTranslator};

/// Everything the engine needs to know about one synced kind
#[derive(Clone)]
pub struct KindDescriptor {
    /// Group, version and kind
    pub gvk: GroupVersionKind,
    /// API resource (with plural) used for every call
    pub api_resource: ApiResource,
    /// Namespaced or cluster-scoped
    pub scope: Scope,
    /// Virtual objects are created and updated on the host
    pub sync_to_host: bool,
    /// Managed host objects without a virtual counterpart are materialized virtually
    pub create_virtual: bool,
    /// Host status is mirrored into the virtual object's status subresource
    pub has_status: bool,
    /// JSON pointers the host owns and writes back to the virtual object
    pub back_sync: Vec<String>,
    /// Virtual status reports the node's shared Service address as host IP
    pub reports_node_ip: bool,
    /// How host objects are recognized as ours
    pub ownership: OwnershipPolicy,
    /// Requeue interval after a rejected host write
    pub resync_interval: Duration,
    /// Object translation
    pub translator: Arc<dyn KindTranslator>,
}

impl fmt::Debug for KindDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindDescriptor")
            .field("gvk", &gvk_string(&self.gvk))
            .field("scope", &self.scope)
            .field("sync_to_host", &self.sync_to_host)
            .field("create_virtual", &self.create_virtual)
            .field("has_status", &self.has_status)
            .field("back_sync", &self.back_sync)
            .field("reports_node_ip", &self.reports_node_ip)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

impl KindDescriptor {
    /// Bidirectional, namespaced kind with the plain translator
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self {
            api_resource: ApiResource::from_gvk_with_plural(&gvk, plural),
            gvk,
            scope: Scope::Namespaced,
            sync_to_host: true,
            create_virtual: false,
            has_status: false,
            back_sync: Vec::new(),
            reports_node_ip: false,
            ownership: OwnershipPolicy::Standard,
            resync_interval: Duration::from_secs(300),
            translator: Arc::new(GenericTranslator::new()),
        }
    }

    /// Mark the kind cluster-scoped
    pub fn cluster_scoped(mut self) -> Self {
        self.scope = Scope::Cluster;
        self
    }

    /// Mirror host status into the virtual object
    pub fn with_status(mut self) -> Self {
        self.has_status = true;
        self
    }

    /// Let the host own the field at `pointer`
    pub fn back_sync(mut self, pointer: &str) -> Self {
        self.back_sync.push(pointer.to_string());
        self
    }

    /// Rewrite `status.hostIP` to the address of the node's shared Service
    pub fn reports_node_ip(mut self) -> Self {
        self.reports_node_ip = true;
        self
    }

    /// Use a custom translator
    pub fn with_translator(mut self, translator: impl KindTranslator + 'static) -> Self {
        self.translator = Arc::new(translator);
        self
    }

    /// Use a custom ownership policy
    pub fn with_ownership(mut self, ownership: OwnershipPolicy) -> Self {
        self.ownership = ownership;
        self
    }

    /// Objects originate on the host and are only mirrored into the virtual cluster
    pub fn host_to_virtual(mut self) -> Self {
        self.sync_to_host = false;
        self.create_virtual = true;
        self
    }

    /// Key used for snapshots, metrics and logs
    pub fn kind_key(&self) -> String {
        gvk_string(&self.gvk)
    }
}

/// Built-in descriptors, keyed by `[group/]version/Kind`
fn builtin(name: &str) -> Option<KindDescriptor> {
    let descriptor = match name {
        "v1/ConfigMap" => KindDescriptor::new("", "v1", "ConfigMap", "configmaps"),
        "v1/Secret" => KindDescriptor::new("", "v1", "Secret", "secrets"),
        "v1/Service" => KindDescriptor::new("", "v1", "Service", "services")
            .with_status()
            .back_sync("/spec/clusterIP")
            .back_sync("/spec/clusterIPs")
            .with_translator(GenericTranslator::new().with_label_map("/spec/selector")),
        "v1/Endpoints" => KindDescriptor::new("", "v1", "Endpoints", "endpoints"),
        "v1/ServiceAccount" => {
            KindDescriptor::new("", "v1", "ServiceAccount", "serviceaccounts")
        }
        "v1/PersistentVolumeClaim" => KindDescriptor::new(
            "",
            "v1",
            "PersistentVolumeClaim",
            "persistentvolumeclaims",
        )
        .with_status()
        .back_sync("/spec/volumeName"),
        "v1/Pod" => KindDescriptor::new("", "v1", "Pod", "pods")
            .with_status()
            .back_sync("/spec/nodeName")
            .reports_node_ip(),
        "v1/Event" => KindDescriptor::new("", "v1", "Event", "events")
            .host_to_virtual()
            .with_ownership(OwnershipPolicy::AlwaysManaged)
            .with_translator(EventTranslator),
        "networking.k8s.io/v1/Ingress" => {
            KindDescriptor::new("networking.k8s.io", "v1", "Ingress", "ingresses").with_status()
        }
        "networking.k8s.io/v1/NetworkPolicy" => {
            KindDescriptor::new("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies")
                .with_translator(
                    GenericTranslator::new().with_label_selector("/spec/podSelector"),
                )
        }
        "scheduling.k8s.io/v1/PriorityClass" => {
            KindDescriptor::new("scheduling.k8s.io", "v1", "PriorityClass", "priorityclasses")
                .cluster_scoped()
        }
        _ => return None,
    };
    Some(descriptor)
}

/// Synced kinds, looked up by GVK
#[derive(Clone, Debug, Default)]
pub struct DescriptorRegistry {
    kinds: BTreeMap<String, Arc<KindDescriptor>>,
}

impl DescriptorRegistry {
    /// Registry of the kinds enabled in `config`
    ///
    /// Fails with a validation error naming the first unknown kind.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let mut registry = Self::default();
        for name in &config.enabled_kinds {
            let mut descriptor = builtin(name).ok_or_else(|| {
                Error::validation_for_field(
                    "enabledKinds",
                    format!("'{name}' is not a kind this syncer knows how to sync"),
                )
            })?;
            descriptor.resync_interval = config.resync_interval();
            registry.register(descriptor);
        }
        Ok(registry)
    }

    /// Add or replace a descriptor
    pub fn register(&mut self, descriptor: KindDescriptor) {
        self.kinds
            .insert(descriptor.kind_key(), Arc::new(descriptor));
    }

    /// Descriptor for `gvk`
    pub fn get(&self, gvk: &GroupVersionKind) -> Option<Arc<KindDescriptor>> {
        self.kinds.get(&gvk_string(gvk)).cloned()
    }

    /// Descriptor for a kind name, ignoring group and version
    pub fn get_by_kind(&self, kind: &str) -> Option<&KindDescriptor> {
        self.kinds
            .values()
            .find(|d| d.gvk.kind == kind)
            .map(Arc::as_ref)
    }

    /// All descriptors in GVK order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<KindDescriptor>> {
        self.kinds.values()
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kind is registered
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_every_default_kind() {
        let config = SyncConfig::builder("tenant", "team-a").build().unwrap();
        let registry = DescriptorRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), config.enabled_kinds.len());

        let pod = registry
            .get(&GroupVersionKind::gvk("", "v1", "Pod"))
            .unwrap();
        assert!(pod.has_status);
        assert_eq!(pod.back_sync, vec!["/spec/nodeName".to_string()]);
        assert!(pod.reports_node_ip);
        assert_eq!(pod.api_resource.plural, "pods");
        assert_eq!(pod.resync_interval, config.resync_interval());
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let config = SyncConfig::builder("tenant", "team-a")
            .enabled_kinds(["v1/ConfigMap", "apps/v1/Deployment"])
            .build()
            .unwrap();
        let err = DescriptorRegistry::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("apps/v1/Deployment"));
    }

    #[test]
    fn events_flow_host_to_virtual_only() {
        let config = SyncConfig::builder("tenant", "team-a")
            .enabled_kinds(["v1/Event"])
            .build()
            .unwrap();
        let registry = DescriptorRegistry::from_config(&config).unwrap();
        let event = registry.get_by_kind("Event").unwrap();
        assert!(!event.sync_to_host);
        assert!(event.create_virtual);
        assert!(matches!(event.ownership, OwnershipPolicy::AlwaysManaged));
    }

    #[test]
    fn priority_classes_are_cluster_scoped() {
        let config = SyncConfig::builder("tenant", "team-a")
            .enabled_kinds(["scheduling.k8s.io/v1/PriorityClass"])
            .build()
            .unwrap();
        let registry = DescriptorRegistry::from_config(&config).unwrap();
        let pc = registry
            .get(&GroupVersionKind::gvk("scheduling.k8s.io", "v1", "PriorityClass"))
            .unwrap();
        assert_eq!(pc.scope, Scope::Cluster);
        assert_eq!(pc.kind_key(), "scheduling.k8s.io/v1, Kind=PriorityClass");
    }
}
