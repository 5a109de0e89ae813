//! Common types for vsync: errors, configuration, and observability plumbing

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod key;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use config::{MarkerPolicy, NamespaceMode, SyncConfig, SyncConfigBuilder};
pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use key::ObjectKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of a DNS-1123 label, the limit for most object names
pub const MAX_NAME_LENGTH: usize = 63;

/// Label marking host objects created by a vsync instance
pub const MARKER_LABEL: &str = "vcluster.loft.sh/managed-by";

/// Label carrying the virtual namespace of a namespaced host object
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";

/// Prefix of hashed label keys translated from the virtual cluster
pub const LABEL_PREFIX: &str = "vcluster.loft.sh/label";

/// Label set on host objects by a host-side controller; preserved, never synced back
pub const CONTROLLER_LABEL: &str = "vcluster.loft.sh/controlled-by";

/// Well-known annotation keys written on host objects.
pub mod annotations {
    /// Name of the virtual object
    pub const OBJECT_NAME: &str = "vcluster.loft.sh/object-name";
    /// Namespace of the virtual object
    pub const OBJECT_NAMESPACE: &str = "vcluster.loft.sh/object-namespace";
    /// UID of the virtual object
    pub const OBJECT_UID: &str = "vcluster.loft.sh/object-uid";
    /// GroupVersionKind of the synced object, e.g. `apps/v1, Kind=Deployment`
    pub const OBJECT_KIND: &str = "vcluster.loft.sh/object-kind";
    /// Newline-separated, sorted annotation keys copied from the virtual object
    pub const MANAGED_ANNOTATIONS: &str = "vcluster.loft.sh/managed-annotations";
    /// Newline-separated, sorted label keys copied from the virtual object
    pub const MANAGED_LABELS: &str = "vcluster.loft.sh/managed-labels";

    /// Identity annotations, never copied verbatim between clusters
    pub const IDENTITY: [&str; 4] = [OBJECT_NAME, OBJECT_NAMESPACE, OBJECT_UID, OBJECT_KIND];
}
