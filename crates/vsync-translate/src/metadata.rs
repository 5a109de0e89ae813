//! Label and annotation translation with ownership tracking.
//!
//! Host objects are shared with the host cluster's own controllers, which
//! freely add labels and annotations. To avoid deleting their keys, every
//! host object records which keys came from the virtual object in two
//! manifest annotations (`managed-annotations`, `managed-labels`). On each
//! translation only keys listed in the previous manifest may be removed;
//! everything else on the host is carried over untouched.
//!
//! Virtual label keys are hashed into the `vcluster.loft.sh/label` namespace
//! (unless they match a passthrough pattern) so tenants cannot collide with
//! host labels or with each other. Hashing is one-way: a host key is mapped
//! back only by re-hashing the keys of the current virtual object.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta};
use kube::api::GroupVersionKind;
use kube::discovery::Scope;
use vsync_common::hash::sha256_hex_prefix;
use vsync_common::{
    annotations, SyncConfig, CONTROLLER_LABEL, LABEL_PREFIX, MARKER_LABEL, NAMESPACE_LABEL,
};

use crate::names::{safe_concat_name, NameTranslator};

type StringMap = BTreeMap<String, String>;

/// Labels and annotations computed for a host object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostMetadata {
    /// Full host label map
    pub labels: StringMap,
    /// Full host annotation map
    pub annotations: StringMap,
}

/// Translates labels and annotations between the two clusters
#[derive(Clone, Debug)]
pub struct MetadataTranslator {
    config: Arc<SyncConfig>,
    names: NameTranslator,
}

impl MetadataTranslator {
    /// Create a translator for the given instance
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self {
            names: NameTranslator::new(config.clone()),
            config,
        }
    }

    /// Name translator sharing this instance's configuration
    pub fn names(&self) -> &NameTranslator {
        &self.names
    }

    /// Whether `key` is copied verbatim rather than hashed
    pub fn is_passthrough(&self, key: &str) -> bool {
        self.config.label_passthrough.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => key.starts_with(prefix) && key.len() > prefix.len(),
                None => pattern == key,
            }
        })
    }

    /// Host label key for a virtual label key
    pub fn host_label_key(&self, key: &str, scope: &Scope) -> String {
        if self.is_passthrough(key) {
            return key.to_string();
        }
        let digest = sha256_hex_prefix(key, 10);
        match scope {
            Scope::Namespaced => {
                safe_concat_name(&[LABEL_PREFIX, self.config.suffix(), "x", &digest])
            }
            Scope::Cluster => safe_concat_name(&[
                LABEL_PREFIX,
                self.config.cluster_scope_namespace(),
                "x",
                self.config.suffix(),
                "x",
                &digest,
            ]),
        }
    }

    /// Keys the syncer owns outright and never takes from either side's user data
    fn is_reserved_label(key: &str) -> bool {
        key == MARKER_LABEL
            || key == NAMESPACE_LABEL
            || key == CONTROLLER_LABEL
            || key.starts_with(LABEL_PREFIX)
    }

    fn is_reserved_annotation(&self, key: &str) -> bool {
        annotations::IDENTITY.contains(&key)
            || key == annotations::MANAGED_ANNOTATIONS
            || key == annotations::MANAGED_LABELS
            || self.config.excluded_annotations.iter().any(|k| k == key)
    }

    /// Translate label keys of a virtual map without adding syncer labels
    ///
    /// Used for selectors embedded in object specs.
    pub fn host_label_map(&self, labels: &StringMap, scope: &Scope) -> StringMap {
        labels
            .iter()
            .filter(|(k, _)| !Self::is_reserved_label(k))
            .map(|(k, v)| (self.host_label_key(k, scope), v.clone()))
            .collect()
    }

    /// Translate a label selector's keys to host keys
    pub fn host_label_selector(&self, selector: &LabelSelector, scope: &Scope) -> LabelSelector {
        LabelSelector {
            match_labels: selector
                .match_labels
                .as_ref()
                .map(|labels| self.host_label_map(labels, scope)),
            match_expressions: selector.match_expressions.as_ref().map(|exprs| {
                exprs
                    .iter()
                    .map(|r| LabelSelectorRequirement {
                        key: self.host_label_key(&r.key, scope),
                        operator: r.operator.clone(),
                        values: r.values.clone(),
                    })
                    .collect()
            }),
        }
    }

    /// Host labels for `virtual_meta`, preserving foreign keys of `prior_host`
    ///
    /// Returns the full label map and the set of keys that originate from the
    /// virtual object (the next `managed-labels` manifest).
    pub fn host_labels(
        &self,
        virtual_meta: &ObjectMeta,
        prior_host: Option<&ObjectMeta>,
        scope: &Scope,
    ) -> (StringMap, BTreeSet<String>) {
        let translated = virtual_meta
            .labels
            .as_ref()
            .map(|labels| self.host_label_map(labels, scope))
            .unwrap_or_default();
        let managed: BTreeSet<String> = translated.keys().cloned().collect();

        let mut labels = StringMap::new();
        if let Some(host) = prior_host {
            let previously_managed = manifest(host, annotations::MANAGED_LABELS);
            for (k, v) in host.labels.iter().flatten() {
                if previously_managed.contains(k) || k == MARKER_LABEL || k == NAMESPACE_LABEL {
                    continue;
                }
                labels.insert(k.clone(), v.clone());
            }
        }
        labels.extend(translated);

        labels.insert(MARKER_LABEL.to_string(), self.names.marker_value(scope));
        match (scope, virtual_meta.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) if !ns.is_empty() => {
                labels.insert(NAMESPACE_LABEL.to_string(), ns.to_string());
            }
            _ => {}
        }

        (labels, managed)
    }

    /// Host annotations for `virtual_meta`, preserving foreign keys of `prior_host`
    ///
    /// `managed_labels` is the label manifest returned by [`Self::host_labels`].
    pub fn host_annotations(
        &self,
        virtual_meta: &ObjectMeta,
        prior_host: Option<&ObjectMeta>,
        gvk: &GroupVersionKind,
        managed_labels: &BTreeSet<String>,
    ) -> StringMap {
        let copied: StringMap = virtual_meta
            .annotations
            .iter()
            .flatten()
            .filter(|(k, _)| !self.is_reserved_annotation(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut result = StringMap::new();
        if let Some(host) = prior_host {
            let previously_managed = manifest(host, annotations::MANAGED_ANNOTATIONS);
            for (k, v) in host.annotations.iter().flatten() {
                if previously_managed.contains(k)
                    || annotations::IDENTITY.contains(&k.as_str())
                    || k == annotations::MANAGED_ANNOTATIONS
                    || k == annotations::MANAGED_LABELS
                {
                    continue;
                }
                result.insert(k.clone(), v.clone());
            }
        }

        set_manifest(&mut result, annotations::MANAGED_ANNOTATIONS, copied.keys());
        set_manifest(&mut result, annotations::MANAGED_LABELS, managed_labels.iter());
        result.extend(copied);

        result.insert(
            annotations::OBJECT_NAME.to_string(),
            virtual_meta.name.clone().unwrap_or_default(),
        );
        match virtual_meta.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => {
                result.insert(annotations::OBJECT_NAMESPACE.to_string(), ns.to_string());
            }
            _ => {}
        }
        if let Some(uid) = virtual_meta.uid.as_deref().filter(|u| !u.is_empty()) {
            result.insert(annotations::OBJECT_UID.to_string(), uid.to_string());
        }
        result.insert(annotations::OBJECT_KIND.to_string(), crate::gvk_string(gvk));

        result
    }

    /// Labels and annotations for the host counterpart of `virtual_meta`
    pub fn host_metadata(
        &self,
        virtual_meta: &ObjectMeta,
        prior_host: Option<&ObjectMeta>,
        gvk: &GroupVersionKind,
        scope: &Scope,
    ) -> HostMetadata {
        let (labels, managed_labels) = self.host_labels(virtual_meta, prior_host, scope);
        let annotations = self.host_annotations(virtual_meta, prior_host, gvk, &managed_labels);
        HostMetadata {
            labels,
            annotations,
        }
    }

    /// Virtual labels after pulling host-side changes to synced keys
    ///
    /// Only keys that the current virtual object maps to are considered; a
    /// host value that changed since `host_before` is written back. Host-only
    /// labels never reach the virtual object.
    pub fn virtual_labels(
        &self,
        host: &ObjectMeta,
        host_before: Option<&ObjectMeta>,
        virtual_meta: &ObjectMeta,
        scope: &Scope,
    ) -> StringMap {
        let mut labels = virtual_meta.labels.clone().unwrap_or_default();
        let Some(before) = host_before else {
            return labels;
        };

        let candidates: Vec<String> = labels.keys().cloned().collect();
        for virtual_key in candidates {
            if Self::is_reserved_label(&virtual_key) {
                continue;
            }
            let host_key = self.host_label_key(&virtual_key, scope);
            let now = host.labels.as_ref().and_then(|l| l.get(&host_key));
            let then = before.labels.as_ref().and_then(|l| l.get(&host_key));
            if now == then {
                continue;
            }
            match now {
                Some(value) => labels.insert(virtual_key, value.clone()),
                None => labels.remove(&virtual_key),
            };
        }
        labels
    }

    /// Virtual annotations after pulling host-side changes to synced keys
    ///
    /// Only keys listed in the host's annotation manifest (before or now) are
    /// pulled back.
    pub fn virtual_annotations(
        &self,
        host: &ObjectMeta,
        host_before: Option<&ObjectMeta>,
        virtual_meta: &ObjectMeta,
    ) -> StringMap {
        let mut result = virtual_meta.annotations.clone().unwrap_or_default();
        let Some(before) = host_before else {
            return result;
        };

        let mut keys = manifest(host, annotations::MANAGED_ANNOTATIONS);
        keys.extend(manifest(before, annotations::MANAGED_ANNOTATIONS));
        for key in keys {
            if self.is_reserved_annotation(&key) {
                continue;
            }
            let now = host.annotations.as_ref().and_then(|a| a.get(&key));
            let then = before.annotations.as_ref().and_then(|a| a.get(&key));
            if now == then {
                continue;
            }
            match now {
                Some(value) => result.insert(key, value.clone()),
                None => result.remove(&key),
            };
        }
        result
    }
}

/// Keys recorded in a manifest annotation
pub fn manifest(meta: &ObjectMeta, annotation: &str) -> BTreeSet<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(annotation))
        .map(|v| {
            v.split('\n')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn set_manifest<'a>(
    target: &mut StringMap,
    annotation: &str,
    keys: impl Iterator<Item = &'a String>,
) {
    // BTreeMap/BTreeSet iteration is already sorted
    let joined = keys.map(String::as_str).collect::<Vec<_>>().join("\n");
    if joined.is_empty() {
        target.remove(annotation);
    } else {
        target.insert(annotation.to_string(), joined);
    }
}
