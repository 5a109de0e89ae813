//! External mutation of translated objects.
//!
//! A [`MutationHook`] sees the canonical JSON of every object the engine is
//! about to write and may return a modified version. The result is only
//! accepted if it still describes the same object.

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind};
use tracing::debug;
use vsync_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Which way the translated object is headed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookDirection {
    /// About to be written to the host cluster
    ToHost,
    /// About to be written to the virtual cluster
    ToVirtual,
}

/// Capability that may rewrite an object before it is written
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MutationHook: Send + Sync {
    /// Return the (possibly modified) canonical JSON of the object
    async fn mutate(
        &self,
        direction: HookDirection,
        gvk: &GroupVersionKind,
        object: Vec<u8>,
    ) -> Result<Vec<u8>>;
}

/// Run `obj` through `hook`, rejecting results that change its identity
///
/// The object is serialized with sorted keys, so identical objects always
/// produce identical bytes.
pub async fn apply_hook(
    hook: &dyn MutationHook,
    direction: HookDirection,
    gvk: &GroupVersionKind,
    obj: DynamicObject,
) -> Result<DynamicObject> {
    // serde_json::Value keeps object keys sorted
    let canonical = serde_json::to_value(&obj)?;
    let bytes = serde_json::to_vec(&canonical)?;
    let mutated = hook.mutate(direction, gvk, bytes).await?;
    let result: DynamicObject = serde_json::from_slice(&mutated)
        .map_err(|e| Error::serialization_for_kind(&gvk.kind, e.to_string()))?;

    check_identity("apiVersion", api_version(&obj), api_version(&result))?;
    check_identity("kind", kind(&obj), kind(&result))?;
    check_identity("metadata.name", obj.metadata.name.as_deref(), result.metadata.name.as_deref())?;
    check_identity(
        "metadata.namespace",
        obj.metadata.namespace.as_deref(),
        result.metadata.namespace.as_deref(),
    )?;

    if result != obj {
        debug!(kind = %gvk.kind, ?direction, "mutation hook modified object");
    }
    Ok(result)
}

fn api_version(obj: &DynamicObject) -> Option<&str> {
    obj.types.as_ref().map(|t| t.api_version.as_str())
}

fn kind(obj: &DynamicObject) -> Option<&str> {
    obj.types.as_ref().map(|t| t.kind.as_str())
}

fn check_identity(field: &str, before: Option<&str>, after: Option<&str>) -> Result<()> {
    if before == after {
        return Ok(());
    }
    Err(Error::validation_for_field(
        field,
        format!(
            "mutation hook changed object identity from {:?} to {:?}",
            before.unwrap_or_default(),
            after.unwrap_or_default()
        ),
    ))
}
