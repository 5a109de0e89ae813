//! Three-way merge between a virtual object and its host counterpart.
//!
//! The patcher works on four snapshots: the virtual and host objects as they
//! are now, and as they were when the engine last converged them. From those
//! it computes the desired state of both sides, then the minimal merge
//! patches that get there:
//!
//! - desired spec flows virtual → host; keys removed on the virtual side are
//!   removed from the host, keys only the host has (API defaults, fields set
//!   by host controllers) survive
//! - back-synced fields and status flow host → virtual
//! - labels and annotations flow both ways through the metadata translator,
//!   with the virtual side winning when both changed
//!
//! Every patch carries `metadata.resourceVersion`, so a write based on a
//! stale read fails with a conflict instead of clobbering newer data.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde_json::{json, Map, Value};
use vsync_common::Result;

use crate::json::{
    create_merge_patch, is_empty_patch, overlay, replay, set_pointer, set_resource_version,
};
use crate::translator::TranslateContext;

/// The four observations one reconcile works from
#[derive(Clone, Copy, Debug)]
pub struct SyncEvent<'a> {
    /// Virtual object at the last convergence
    pub virtual_before: Option<&'a DynamicObject>,
    /// Virtual object now
    pub virtual_obj: &'a DynamicObject,
    /// Host object at the last convergence
    pub host_before: Option<&'a DynamicObject>,
    /// Host object now
    pub host: &'a DynamicObject,
}

/// Desired state of both sides after a reconcile
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    /// Desired host object (status excluded)
    pub host: DynamicObject,
    /// Desired virtual object (status excluded)
    pub virtual_obj: DynamicObject,
    /// Desired virtual status, for kinds with a status subresource
    pub virtual_status: Option<Value>,
}

/// Writes needed to reach a [`DesiredState`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchPlan {
    /// Merge patch for the host object
    pub host: Option<Value>,
    /// Merge patch for the virtual object
    pub virtual_object: Option<Value>,
    /// Merge patch for the virtual status subresource; the resource version
    /// is added at write time since the main patch changes it
    pub virtual_status: Option<Value>,
}

impl PatchPlan {
    /// Whether nothing needs to be written
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.virtual_object.is_none() && self.virtual_status.is_none()
    }
}

/// Computes desired states and patch plans
pub struct Patcher;

impl Patcher {
    /// Desired state of a kind synced virtual → host
    pub fn desired(ctx: &TranslateContext<'_>, event: &SyncEvent<'_>) -> Result<DesiredState> {
        let translator = &ctx.descriptor.translator;
        let virtual_obj = event.virtual_obj;
        let host = event.host;

        // metadata: pull host edits only if the virtual side did not change
        let mut virtual_meta = virtual_obj.metadata.clone();
        let virtual_meta_unchanged = event
            .virtual_before
            .is_some_and(|before| same_metadata(before, virtual_obj));
        if virtual_meta_unchanged {
            let host_before = event.host_before.map(|h| &h.metadata);
            let labels = ctx.metadata.virtual_labels(
                &host.metadata,
                host_before,
                &virtual_obj.metadata,
                ctx.scope(),
            );
            let annotations =
                ctx.metadata
                    .virtual_annotations(&host.metadata, host_before, &virtual_obj.metadata);
            virtual_meta.labels = non_empty(labels);
            virtual_meta.annotations = non_empty(annotations);
        }
        let host_meta =
            ctx.metadata
                .host_metadata(&virtual_meta, Some(&host.metadata), ctx.gvk(), ctx.scope());

        // spec: replay the virtual change onto the live host body
        let translated_now = translator.host_data(ctx, virtual_obj)?;
        let translated_before = match event.virtual_before {
            Some(before) => translator.host_data(ctx, before)?,
            None => translated_now.clone(),
        };
        let mut host_data = without_status(&host.data);
        replay(&mut host_data, &translated_before, &translated_now);
        overlay(&mut host_data, &translated_now);

        // back-synced fields
        let mut virtual_data = without_status(&virtual_obj.data);
        for pointer in &ctx.descriptor.back_sync {
            let host_now = host.data.pointer(pointer);
            let host_then = event.host_before.and_then(|h| h.data.pointer(pointer));
            let virtual_now = virtual_obj.data.pointer(pointer);
            let virtual_then = event.virtual_before.and_then(|v| v.data.pointer(pointer));

            let host_changed = event.host_before.is_none() || host_now != host_then;
            let virtual_changed = event.virtual_before.is_some() && virtual_now != virtual_then;

            match (host_now, virtual_now) {
                (Some(value), current) if current != Some(value) && !virtual_changed
                    && (host_changed || current.is_none()) =>
                {
                    set_pointer(&mut virtual_data, pointer, value.clone())?;
                }
                (current, Some(value)) if current != Some(value) && virtual_changed && !host_changed => {
                    set_pointer(&mut host_data, pointer, value.clone())?;
                }
                _ => {}
            }
        }

        let mut desired_host = host.clone();
        desired_host.metadata.labels = Some(host_meta.labels);
        desired_host.metadata.annotations = Some(host_meta.annotations);
        desired_host.data = with_status_of(host_data, &host.data);

        let mut desired_virtual = virtual_obj.clone();
        desired_virtual.metadata = virtual_meta;
        desired_virtual.data = with_status_of(virtual_data, &virtual_obj.data);

        let virtual_status = if ctx.descriptor.has_status {
            host.data.get("status").cloned()
        } else {
            None
        };

        Ok(DesiredState {
            host: desired_host,
            virtual_obj: desired_virtual,
            virtual_status,
        })
    }

    /// Desired state of a kind that only flows host → virtual
    pub fn desired_from_host(
        ctx: &TranslateContext<'_>,
        event: &SyncEvent<'_>,
    ) -> Result<DesiredState> {
        let key = vsync_common::ObjectKey::from_object(event.virtual_obj);
        let mirrored = ctx
            .descriptor
            .translator
            .virtual_data(ctx, event.host, &key)?;

        let mut virtual_data = without_status(&event.virtual_obj.data);
        overlay(&mut virtual_data, &mirrored);

        let mut desired_virtual = event.virtual_obj.clone();
        desired_virtual.data = with_status_of(virtual_data, &event.virtual_obj.data);

        Ok(DesiredState {
            host: event.host.clone(),
            virtual_obj: desired_virtual,
            virtual_status: if ctx.descriptor.has_status {
                event.host.data.get("status").cloned()
            } else {
                None
            },
        })
    }

    /// Merge patches turning the current objects of `event` into `desired`
    pub fn plan(event: &SyncEvent<'_>, desired: &DesiredState) -> PatchPlan {
        let host = object_patch(event.host, &desired.host);
        let virtual_object = object_patch(event.virtual_obj, &desired.virtual_obj);

        let virtual_status = desired.virtual_status.as_ref().and_then(|status| {
            let current = event.virtual_obj.data.get("status").unwrap_or(&Value::Null);
            if current == status {
                return None;
            }
            Some(json!({ "status": create_merge_patch(current, status) }))
        });

        PatchPlan {
            host,
            virtual_object,
            virtual_status,
        }
    }
}

/// Patch for labels, annotations and body (status excluded), with a
/// resource version precondition; `None` when nothing differs
fn object_patch(current: &DynamicObject, desired: &DynamicObject) -> Option<Value> {
    let patch = create_merge_patch(&patchable(current), &patchable(desired));
    if is_empty_patch(&patch) {
        return None;
    }
    let mut patch = patch;
    if let Some(rv) = current.metadata.resource_version.as_deref() {
        set_resource_version(&mut patch, rv);
    }
    Some(patch)
}

/// The parts of an object the engine writes through the main resource
fn patchable(obj: &DynamicObject) -> Value {
    let mut value = without_status(&obj.data);
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    let annotations = obj.metadata.annotations.clone().unwrap_or_default();
    if let Value::Object(map) = &mut value {
        map.insert(
            "metadata".to_string(),
            json!({ "labels": labels, "annotations": annotations }),
        );
    }
    value
}

fn without_status(data: &Value) -> Value {
    match data {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove("status");
            Value::Object(map)
        }
        _ => Value::Object(Map::new()),
    }
}

/// `data` with the `status` of `source` put back, if it had one
fn with_status_of(mut data: Value, source: &Value) -> Value {
    if let (Value::Object(map), Some(status)) = (&mut data, source.get("status")) {
        map.insert("status".to_string(), status.clone());
    }
    data
}

fn same_metadata(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.metadata.labels.clone().unwrap_or_default() == b.metadata.labels.clone().unwrap_or_default()
        && a.metadata.annotations.clone().unwrap_or_default()
            == b.metadata.annotations.clone().unwrap_or_default()
}

fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then_some(map)
}
