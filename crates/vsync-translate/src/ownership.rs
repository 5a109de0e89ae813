//! Decides whether a host object was created by this syncer instance.
//!
//! The check is deliberately strict: a host object is only mutated or deleted
//! when its marker label, namespace, identity annotations and kind annotation
//! all agree with what this instance would have written.

use std::fmt;
use std::sync::Arc;

use kube::api::{DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use kube::ResourceExt;
use tracing::trace;
use vsync_common::{annotations, SyncConfig, MARKER_LABEL};

use crate::names::NameTranslator;

/// Custom ownership predicate
pub type OwnershipFn = Arc<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// Per-kind override of the ownership check
#[derive(Clone, Default)]
pub enum OwnershipPolicy {
    /// Marker, namespace, identity and kind checks
    #[default]
    Standard,
    /// Every object in a targeted namespace (cluster-scoped: every object) is managed
    AlwaysManaged,
    /// Kind-specific predicate
    Custom(OwnershipFn),
}

impl fmt::Debug for OwnershipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipPolicy::Standard => f.write_str("Standard"),
            OwnershipPolicy::AlwaysManaged => f.write_str("AlwaysManaged"),
            OwnershipPolicy::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Result of classifying a host object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Created by this instance
    Managed,
    /// Not ours; must not be touched
    Foreign {
        /// Which check failed
        reason: &'static str,
    },
}

impl Ownership {
    /// Whether the object is managed
    pub fn is_managed(&self) -> bool {
        matches!(self, Ownership::Managed)
    }
}

/// Classifies host objects as managed or foreign
#[derive(Clone, Debug)]
pub struct OwnershipClassifier {
    config: Arc<SyncConfig>,
    names: NameTranslator,
}

impl OwnershipClassifier {
    /// Create a classifier for the given instance
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self {
            names: NameTranslator::new(config.clone()),
            config,
        }
    }

    /// Whether `obj` was created by this instance
    pub fn is_managed(
        &self,
        obj: &DynamicObject,
        gvk: &GroupVersionKind,
        scope: &Scope,
        policy: &OwnershipPolicy,
    ) -> bool {
        let ownership = self.classify(obj, gvk, scope, policy);
        if let Ownership::Foreign { reason } = &ownership {
            trace!(
                object = %obj.name_any(),
                namespace = ?obj.namespace(),
                kind = %gvk.kind,
                reason,
                "host object is not managed by this instance"
            );
        }
        ownership.is_managed()
    }

    /// Classify `obj`, reporting the failing check for foreign objects
    pub fn classify(
        &self,
        obj: &DynamicObject,
        gvk: &GroupVersionKind,
        scope: &Scope,
        policy: &OwnershipPolicy,
    ) -> Ownership {
        match policy {
            OwnershipPolicy::AlwaysManaged => self.classify_namespace(obj, scope),
            OwnershipPolicy::Custom(predicate) => {
                if predicate(obj) {
                    Ownership::Managed
                } else {
                    Ownership::Foreign {
                        reason: "custom ownership check failed",
                    }
                }
            }
            OwnershipPolicy::Standard => self.classify_standard(obj, gvk, scope),
        }
    }

    fn classify_namespace(&self, obj: &DynamicObject, scope: &Scope) -> Ownership {
        match (scope, obj.metadata.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) if self.names.is_targeted_namespace(ns) => {
                Ownership::Managed
            }
            (Scope::Namespaced, _) => Ownership::Foreign {
                reason: "namespace is not targeted by this instance",
            },
            (Scope::Cluster, _) => Ownership::Managed,
        }
    }

    fn classify_standard(
        &self,
        obj: &DynamicObject,
        gvk: &GroupVersionKind,
        scope: &Scope,
    ) -> Ownership {
        if let Ownership::Foreign { reason } = self.classify_namespace(obj, scope) {
            return Ownership::Foreign { reason };
        }

        let expected_marker = self.names.marker_value(scope);
        match obj.labels().get(MARKER_LABEL) {
            Some(marker) if *marker == expected_marker => {}
            Some(marker) if self.config.marker_policy.accepts_legacy(marker) => {}
            _ => {
                return Ownership::Foreign {
                    reason: "marker label does not match this instance",
                }
            }
        }

        let annots = obj.annotations();
        if let Some(kind) = annots.get(annotations::OBJECT_KIND) {
            if *kind != crate::gvk_string(gvk) {
                return Ownership::Foreign {
                    reason: "kind annotation does not match",
                };
            }
        }

        if *scope == Scope::Cluster {
            return match annots.get(annotations::OBJECT_NAME) {
                Some(name) if self.names.host_name_cluster_scoped(name) != obj.name_any() => {
                    Ownership::Foreign {
                        reason: "name annotation does not reproduce the host name",
                    }
                }
                _ => Ownership::Managed,
            };
        }

        let Some(name) = annots
            .get(annotations::OBJECT_NAME)
            .filter(|n| !n.is_empty())
        else {
            return Ownership::Foreign {
                reason: "name annotation is missing",
            };
        };
        let namespace = annots
            .get(annotations::OBJECT_NAMESPACE)
            .map(String::as_str)
            .unwrap_or_default();
        if self.names.host_name(name, namespace) != obj.name_any() {
            return Ownership::Foreign {
                reason: "name annotation does not reproduce the host name",
            };
        }

        Ownership::Managed
    }
}
