//! Translation between virtual-cluster and host-cluster coordinates.
//!
//! Everything in this crate is pure and synchronous: given the resolved
//! [`vsync_common::SyncConfig`] and object metadata, it computes host names,
//! host namespaces, host labels and annotations, and decides whether a host
//! object was created by this instance. No lookups, no I/O.

pub mod metadata;
pub mod names;
pub mod ownership;

use kube::api::GroupVersionKind;

pub use metadata::{HostMetadata, MetadataTranslator};
pub use names::{safe_concat_name, NameTranslator};
pub use ownership::{Ownership, OwnershipClassifier, OwnershipPolicy};

/// Render a GVK the way the kind annotation stores it
///
/// `apps/v1, Kind=Deployment`; the core group renders with a leading
/// slash, `/v1, Kind=Pod`.
pub fn gvk_string(gvk: &GroupVersionKind) -> String {
    format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
}
