//! Deterministic virtual → host name and namespace mapping.
//!
//! The mapping is a pure function of the virtual name, virtual namespace and
//! the instance identity. There is no mapping table: the reverse direction is
//! recovered from the identity annotations the syncer writes on every host
//! object.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::discovery::Scope;
use vsync_common::hash::{sha256_base36, sha256_hex_prefix};
use vsync_common::{annotations, NamespaceMode, ObjectKey, SyncConfig, MAX_NAME_LENGTH};

/// Length a too-long name is cut to before the digest is appended
const TRUNCATED_LENGTH: usize = 52;

/// Hex chars of digest appended to truncated names
const DIGEST_LENGTH: usize = 10;

/// Join `parts` with `-`, keeping the result within the DNS label limit.
///
/// Over-long results keep their first 52 characters and get a 10 character
/// digest of the full string appended, so distinct inputs stay distinct.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }
    let digest = sha256_hex_prefix(&full, DIGEST_LENGTH);
    // names are ASCII in practice, but never split a char
    let mut cut = TRUNCATED_LENGTH;
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{}", &full[..cut], digest).replace(".-", "-")
}

/// Maps virtual object coordinates to host object coordinates
#[derive(Clone, Debug)]
pub struct NameTranslator {
    config: Arc<SyncConfig>,
}

impl NameTranslator {
    /// Create a translator for the given instance
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self { config }
    }

    /// Resolved configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Host name of a namespaced virtual object
    ///
    /// In single-namespace mode every virtual namespace lands in the same host
    /// namespace, so the namespace and instance suffix are folded into the
    /// name. In multi-namespace mode the host namespace is already unique.
    pub fn host_name(&self, name: &str, namespace: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        match &self.config.namespace_mode {
            NamespaceMode::Single { .. } => {
                safe_concat_name(&[name, "x", namespace, "x", self.config.suffix()])
            }
            NamespaceMode::Multi { .. } => name.to_string(),
        }
    }

    /// Short (10 character) host name for derived objects such as per-node services
    pub fn host_name_short(&self, name: &str, namespace: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        match &self.config.namespace_mode {
            NamespaceMode::Single { .. } => {
                let key = [name, "x", namespace, "x", self.config.suffix()].join("-");
                let mut short = sha256_base36(&key);
                short.truncate(DIGEST_LENGTH);
                short
            }
            NamespaceMode::Multi { .. } => name.to_string(),
        }
    }

    /// Host name of a cluster-scoped virtual object
    pub fn host_name_cluster_scoped(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        safe_concat_name(&[
            "vcluster",
            name,
            "x",
            self.config.cluster_scope_namespace(),
            "x",
            self.config.suffix(),
        ])
    }

    /// Host namespace for objects in the virtual namespace `namespace`
    pub fn host_namespace(&self, namespace: &str) -> String {
        match &self.config.namespace_mode {
            NamespaceMode::Single { target_namespace } => target_namespace.clone(),
            NamespaceMode::Multi { prefix } => format!(
                "{}-{}-{}",
                prefix,
                sha256_hex_prefix(namespace, 8),
                self.namespace_suffix()
            ),
        }
    }

    /// Whether a host namespace can contain objects of this instance
    pub fn is_targeted_namespace(&self, namespace: &str) -> bool {
        match &self.config.namespace_mode {
            NamespaceMode::Single { target_namespace } => namespace == target_namespace,
            NamespaceMode::Multi { prefix } => {
                namespace.starts_with(&format!("{prefix}-"))
                    && namespace.ends_with(&self.namespace_suffix())
            }
        }
    }

    fn namespace_suffix(&self) -> String {
        sha256_hex_prefix(
            &format!("{}x{}", self.config.current_namespace, self.config.suffix()),
            8,
        )
    }

    /// Marker label value for cluster-scoped host objects
    pub fn cluster_marker(&self) -> String {
        safe_concat_name(&[self.config.cluster_scope_namespace(), "x", self.config.suffix()])
    }

    /// Marker label value for host objects of the given scope
    pub fn marker_value(&self, scope: &Scope) -> String {
        match scope {
            Scope::Namespaced => self.config.suffix().to_string(),
            Scope::Cluster => self.cluster_marker(),
        }
    }

    /// Host coordinates of a virtual object
    pub fn host_key(&self, key: &ObjectKey, scope: &Scope) -> ObjectKey {
        match scope {
            Scope::Namespaced => ObjectKey::namespaced(
                self.host_namespace(key.namespace_str()),
                self.host_name(&key.name, key.namespace_str()),
            ),
            Scope::Cluster => ObjectKey::cluster(self.host_name_cluster_scoped(&key.name)),
        }
    }

    /// Recover the virtual key from a host object's identity annotations
    pub fn virtual_key_from_annotations(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Option<ObjectKey> {
        let name = annotations
            .get(annotations::OBJECT_NAME)
            .filter(|n| !n.is_empty())?;
        Some(match annotations.get(annotations::OBJECT_NAMESPACE) {
            Some(ns) if !ns.is_empty() => ObjectKey::namespaced(ns.clone(), name.clone()),
            _ => ObjectKey::cluster(name.clone()),
        })
    }
}
