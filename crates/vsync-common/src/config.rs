//! Resolved syncer configuration
//!
//! A `SyncConfig` is produced once at startup (from flags, a config file or
//! the builder), validated, and then shared read-only behind an `Arc` by every
//! component. Nothing mutates it after `validate()` succeeds.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Field manager used for writes when none is configured
pub const DEFAULT_FIELD_MANAGER: &str = "vsync-syncer";

/// Kinds synced when the configuration does not list any
pub const DEFAULT_ENABLED_KINDS: &[&str] = &[
    "v1/ConfigMap",
    "v1/Secret",
    "v1/Service",
    "v1/Endpoints",
    "v1/ServiceAccount",
    "v1/PersistentVolumeClaim",
    "v1/Pod",
    "v1/Event",
];

/// How virtual namespaces are laid out on the host cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum NamespaceMode {
    /// Every virtual namespace is folded into one host namespace
    #[serde(rename_all = "camelCase")]
    Single {
        /// Host namespace receiving all namespaced objects
        target_namespace: String,
    },
    /// Every virtual namespace gets its own hashed host namespace
    #[serde(rename_all = "camelCase")]
    Multi {
        /// Prefix of generated host namespaces
        #[serde(default = "default_namespace_prefix")]
        prefix: String,
    },
}

fn default_namespace_prefix() -> String {
    "vcluster".to_string()
}

/// Which marker label values identify objects as created by this instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "camelCase")]
pub enum MarkerPolicy {
    /// Only the current marker value is accepted
    #[default]
    Strict,
    /// Values written by earlier releases are accepted too, and rewritten to
    /// the current value on the next host write
    AcceptLegacy {
        /// Legacy marker values still honored
        values: Vec<String>,
    },
}

impl MarkerPolicy {
    /// Whether `value` is an accepted legacy marker
    pub fn accepts_legacy(&self, value: &str) -> bool {
        match self {
            MarkerPolicy::Strict => false,
            MarkerPolicy::AcceptLegacy { values } => values.iter().any(|v| v == value),
        }
    }
}

/// Immutable configuration shared by every syncer component
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Name of this virtual cluster instance; used as the naming suffix and marker value
    pub instance_name: String,
    /// Host namespace the syncer itself runs in
    pub current_namespace: String,
    /// Host namespace layout
    pub namespace_mode: NamespaceMode,
    /// Kinds to sync, as `group/version/Kind` or `version/Kind` for the core group
    #[serde(default = "default_enabled_kinds")]
    pub enabled_kinds: Vec<String>,
    /// Label keys copied verbatim instead of hashed (exact key or `prefix/*`)
    #[serde(default)]
    pub label_passthrough: Vec<String>,
    /// Annotation keys never copied between clusters
    #[serde(default)]
    pub excluded_annotations: Vec<String>,
    /// Marker migration policy
    #[serde(default)]
    pub marker_policy: MarkerPolicy,
    /// Concurrent reconciles per kind
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Requeue interval after a rejected host write, and the default resync period
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Period of the background List+compare sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Consecutive conflicts on one key before the conflict is surfaced as an error
    #[serde(default = "default_max_conflict_requeues")]
    pub max_conflict_requeues: u32,
    /// How long to wait for the read caches to sync at startup
    #[serde(default = "default_cache_sync_timeout_secs")]
    pub cache_sync_timeout_secs: u64,
    /// Field manager recorded on writes
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
    /// Pod selector of the syncer's kubelet proxy; when set, virtual pods
    /// report a per-node host Service address as their host IP
    #[serde(default)]
    pub node_service_selector: Option<BTreeMap<String, String>>,
}

fn default_enabled_kinds() -> Vec<String> {
    DEFAULT_ENABLED_KINDS.iter().map(|k| k.to_string()).collect()
}

fn default_worker_count() -> usize {
    4
}

fn default_resync_interval_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_conflict_requeues() -> u32 {
    5
}

fn default_cache_sync_timeout_secs() -> u64 {
    60
}

fn default_field_manager() -> String {
    DEFAULT_FIELD_MANAGER.to_string()
}

impl SyncConfig {
    /// Start building a configuration for the given instance
    pub fn builder(
        instance_name: impl Into<String>,
        current_namespace: impl Into<String>,
    ) -> SyncConfigBuilder {
        SyncConfigBuilder::new(instance_name.into(), current_namespace.into())
    }

    /// Naming suffix appended to translated names
    pub fn suffix(&self) -> &str {
        &self.instance_name
    }

    /// Whether all virtual namespaces share one host namespace
    pub fn is_single_namespace(&self) -> bool {
        matches!(self.namespace_mode, NamespaceMode::Single { .. })
    }

    /// Namespace folded into cluster-scoped host names, markers and label keys
    ///
    /// The target namespace in single-namespace mode, the syncer's own
    /// namespace otherwise.
    pub fn cluster_scope_namespace(&self) -> &str {
        match &self.namespace_mode {
            NamespaceMode::Single { target_namespace } => target_namespace,
            NamespaceMode::Multi { .. } => &self.current_namespace,
        }
    }

    /// Requeue interval after a rejected host write
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Period of the background sweep
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Deadline for the read cache barrier
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    /// Check that the configuration is internally consistent
    pub fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.instance_name) {
            return Err(Error::validation_for_field(
                "instanceName",
                format!(
                    "'{}' must be a non-empty lowercase DNS label",
                    self.instance_name
                ),
            ));
        }
        if self.current_namespace.is_empty() {
            return Err(Error::validation_for_field(
                "currentNamespace",
                "must not be empty",
            ));
        }
        match &self.namespace_mode {
            NamespaceMode::Single { target_namespace } if target_namespace.is_empty() => {
                return Err(Error::validation_for_field(
                    "namespaceMode.targetNamespace",
                    "must not be empty in single-namespace mode",
                ));
            }
            NamespaceMode::Multi { prefix } if !is_dns_label(prefix) => {
                return Err(Error::validation_for_field(
                    "namespaceMode.prefix",
                    format!("'{prefix}' must be a lowercase DNS label"),
                ));
            }
            _ => {}
        }
        if self
            .node_service_selector
            .as_ref()
            .is_some_and(BTreeMap::is_empty)
        {
            return Err(Error::validation_for_field(
                "nodeServiceSelector",
                "must select the syncer pods when set",
            ));
        }
        if self.enabled_kinds.is_empty() {
            return Err(Error::validation_for_field(
                "enabledKinds",
                "at least one kind must be enabled",
            ));
        }
        for kind in &self.enabled_kinds {
            let parts = kind.split('/').count();
            if !(2..=3).contains(&parts) || kind.split('/').any(str::is_empty) {
                return Err(Error::validation_for_field(
                    "enabledKinds",
                    format!("'{kind}' is not of the form [group/]version/Kind"),
                ));
            }
        }
        for pattern in &self.label_passthrough {
            let star = pattern.find('*');
            if pattern.is_empty() || (star.is_some() && !pattern.ends_with("/*"))
                || pattern.matches('*').count() > 1
            {
                return Err(Error::validation_for_field(
                    "labelPassthrough",
                    format!("'{pattern}' must be an exact key or end in '/*'"),
                ));
            }
        }
        if self.worker_count == 0 {
            return Err(Error::validation_for_field(
                "workerCount",
                "must be at least 1",
            ));
        }
        if self.resync_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(Error::validation_for_field(
                "resyncIntervalSecs",
                "intervals must be positive",
            ));
        }
        Ok(())
    }
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= crate::MAX_NAME_LENGTH
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Builder for [`SyncConfig`]; `build()` validates the result
#[derive(Debug, Clone)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    fn new(instance_name: String, current_namespace: String) -> Self {
        Self {
            config: SyncConfig {
                namespace_mode: NamespaceMode::Single {
                    target_namespace: current_namespace.clone(),
                },
                instance_name,
                current_namespace,
                enabled_kinds: default_enabled_kinds(),
                label_passthrough: Vec::new(),
                excluded_annotations: Vec::new(),
                marker_policy: MarkerPolicy::Strict,
                worker_count: default_worker_count(),
                resync_interval_secs: default_resync_interval_secs(),
                sweep_interval_secs: default_sweep_interval_secs(),
                max_conflict_requeues: default_max_conflict_requeues(),
                cache_sync_timeout_secs: default_cache_sync_timeout_secs(),
                field_manager: default_field_manager(),
                node_service_selector: None,
            },
        }
    }

    /// Fold all virtual namespaces into `namespace` on the host
    pub fn target_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace_mode = NamespaceMode::Single {
            target_namespace: namespace.into(),
        };
        self
    }

    /// Map every virtual namespace to its own host namespace
    pub fn multi_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.config.namespace_mode = NamespaceMode::Multi {
            prefix: prefix.into(),
        };
        self
    }

    /// Replace the list of synced kinds
    pub fn enabled_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.enabled_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Label keys to copy verbatim
    pub fn label_passthrough<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.label_passthrough = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Annotation keys never copied
    pub fn excluded_annotations<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.excluded_annotations = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Marker migration policy
    pub fn marker_policy(mut self, policy: MarkerPolicy) -> Self {
        self.config.marker_policy = policy;
        self
    }

    /// Concurrent reconciles per kind
    pub fn worker_count(mut self, workers: usize) -> Self {
        self.config.worker_count = workers;
        self
    }

    /// Resync interval after rejected writes
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.config.resync_interval_secs = interval.as_secs();
        self
    }

    /// Sweep period
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval_secs = interval.as_secs();
        self
    }

    /// Consecutive conflict requeues allowed per key
    pub fn max_conflict_requeues(mut self, max: u32) -> Self {
        self.config.max_conflict_requeues = max;
        self
    }

    /// Field manager for writes
    pub fn field_manager(mut self, manager: impl Into<String>) -> Self {
        self.config.field_manager = manager.into();
        self
    }

    /// Publish per-node Services selecting the syncer pods matched by `selector`
    pub fn node_service_selector<I, K, V>(mut self, selector: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.config.node_service_selector = Some(
            selector
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_single_namespace_in_current_namespace() {
        let config = SyncConfig::builder("tenant-a", "team-a").build().unwrap();
        assert_eq!(
            config.namespace_mode,
            NamespaceMode::Single {
                target_namespace: "team-a".to_string()
            }
        );
        assert_eq!(config.suffix(), "tenant-a");
        assert!(config.is_single_namespace());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.resync_interval(), Duration::from_secs(300));
        assert!(config.enabled_kinds.iter().any(|k| k == "v1/Pod"));
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let config: SyncConfig = serde_json::from_value(serde_json::json!({
            "instanceName": "tenant-a",
            "currentNamespace": "team-a",
            "namespaceMode": { "mode": "multi" },
            "labelPassthrough": ["app.kubernetes.io/*"],
            "markerPolicy": { "policy": "acceptLegacy", "values": ["old"] }
        }))
        .unwrap();

        assert_eq!(
            config.namespace_mode,
            NamespaceMode::Multi {
                prefix: "vcluster".to_string()
            }
        );
        assert!(config.marker_policy.accepts_legacy("old"));
        assert!(!config.marker_policy.accepts_legacy("tenant-a"));
        assert_eq!(config.max_conflict_requeues, 5);
        assert_eq!(config.field_manager, DEFAULT_FIELD_MANAGER);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_uppercase_instance_name() {
        let err = SyncConfig::builder("Tenant", "ns").build().unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { field: Some(ref f), .. } if f == "instanceName"
        ));
    }

    #[test]
    fn cluster_scope_namespace_depends_on_mode() {
        let single = SyncConfig::builder("tenant", "syncer-ns")
            .target_namespace("team-a")
            .build()
            .unwrap();
        assert_eq!(single.cluster_scope_namespace(), "team-a");
        let multi = SyncConfig::builder("tenant", "syncer-ns")
            .multi_namespace("vc")
            .build()
            .unwrap();
        assert_eq!(multi.cluster_scope_namespace(), "syncer-ns");
    }

    #[test]
    fn node_service_selector_must_not_be_empty() {
        assert!(SyncConfig::builder("tenant", "ns")
            .node_service_selector(Vec::<(String, String)>::new())
            .build()
            .is_err());
        let config = SyncConfig::builder("tenant", "ns")
            .node_service_selector([("app", "vsync")])
            .build()
            .unwrap();
        assert_eq!(
            config.node_service_selector.unwrap()["app"],
            "vsync"
        );
    }

    #[test]
    fn rejects_empty_target_namespace() {
        let err = SyncConfig::builder("tenant", "ns")
            .target_namespace("")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("single-namespace"));
    }

    #[test]
    fn rejects_malformed_kinds_and_patterns() {
        assert!(SyncConfig::builder("t", "ns")
            .enabled_kinds(["Pod"])
            .build()
            .is_err());
        assert!(SyncConfig::builder("t", "ns")
            .enabled_kinds(["apps//Deployment"])
            .build()
            .is_err());
        assert!(SyncConfig::builder("t", "ns")
            .label_passthrough(["team*"])
            .build()
            .is_err());
        assert!(SyncConfig::builder("t", "ns")
            .label_passthrough(["example.com/*", "team"])
            .build()
            .is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(SyncConfig::builder("t", "ns").worker_count(0).build().is_err());
    }

    #[test]
    fn strict_policy_accepts_no_legacy_values() {
        assert!(!MarkerPolicy::Strict.accepts_legacy("anything"));
    }
}
