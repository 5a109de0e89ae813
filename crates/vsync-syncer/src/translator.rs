//! Per-kind object translation.
//!
//! A [`KindTranslator`] turns a virtual object into its desired host form and
//! back. The default methods cover every kind whose host object is the
//! virtual object with renamed coordinates and translated metadata;
//! [`GenericTranslator`] adds the spec rewrites some kinds need (label maps
//! and label selectors pointing at other synced objects). [`EventTranslator`]
//! maps host Events onto the virtual objects they are about.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::trace;
use vsync_common::{annotations, Error, ObjectKey, Result, MARKER_LABEL, NAMESPACE_LABEL};
use vsync_translate::metadata::manifest;
use vsync_translate::{MetadataTranslator, NameTranslator};

use crate::client::ClusterClient;
use crate::descriptor::KindDescriptor;
use crate::json::{remove_pointer, set_pointer};

/// Everything a translator needs besides the objects themselves
#[derive(Clone, Copy)]
pub struct TranslateContext<'a> {
    /// Kind being translated
    pub descriptor: &'a KindDescriptor,
    /// Metadata translator of this instance
    pub metadata: &'a MetadataTranslator,
}

impl<'a> TranslateContext<'a> {
    /// Bundle a descriptor with the instance's metadata translator
    pub fn new(descriptor: &'a KindDescriptor, metadata: &'a MetadataTranslator) -> Self {
        Self {
            descriptor,
            metadata,
        }
    }

    /// Name translator of this instance
    pub fn names(&self) -> &'a NameTranslator {
        self.metadata.names()
    }

    /// GVK of the kind
    pub fn gvk(&self) -> &'a GroupVersionKind {
        &self.descriptor.gvk
    }

    /// Scope of the kind
    pub fn scope(&self) -> &'a Scope {
        &self.descriptor.scope
    }
}

/// Translation between a virtual object and its host counterpart
#[async_trait]
pub trait KindTranslator: Send + Sync {
    /// Host coordinates of the virtual object at `key`
    fn host_key(&self, ctx: &TranslateContext<'_>, key: &ObjectKey) -> ObjectKey {
        ctx.names().host_key(key, ctx.scope())
    }

    /// Virtual key a host object belongs to, `None` if it maps to nothing
    async fn virtual_key(
        &self,
        ctx: &TranslateContext<'_>,
        host: &DynamicObject,
        _host_client: &dyn ClusterClient,
    ) -> Result<Option<ObjectKey>> {
        Ok(ctx.names().virtual_key_from_annotations(host.annotations()))
    }

    /// Desired host body (everything except metadata) for a virtual object
    ///
    /// Never contains `status` or the kind's back-synced fields.
    fn host_data(&self, ctx: &TranslateContext<'_>, virtual_obj: &DynamicObject) -> Result<Value> {
        Ok(strip_host_owned(ctx, &virtual_obj.data))
    }

    /// Desired virtual body for a host object mapped to `key`
    fn virtual_data(
        &self,
        ctx: &TranslateContext<'_>,
        host: &DynamicObject,
        _key: &ObjectKey,
    ) -> Result<Value> {
        let mut data = object_or_empty(&host.data);
        if ctx.descriptor.has_status {
            remove_pointer(&mut data, "/status");
        }
        Ok(data)
    }

    /// Full host object to create for a virtual object
    fn to_host(&self, ctx: &TranslateContext<'_>, virtual_obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_object(virtual_obj);
        let host_key = self.host_key(ctx, &key);
        if host_key.name.is_empty() {
            return Err(Error::translation(
                &ctx.descriptor.gvk.kind,
                key.to_string(),
                "virtual object has no name",
            ));
        }
        let meta = ctx
            .metadata
            .host_metadata(&virtual_obj.metadata, None, ctx.gvk(), ctx.scope());

        let mut host = DynamicObject::new(&host_key.name, &ctx.descriptor.api_resource);
        host.metadata.namespace = host_key.namespace;
        host.metadata.labels = Some(meta.labels);
        host.metadata.annotations = Some(meta.annotations);
        host.data = self.host_data(ctx, virtual_obj)?;
        Ok(host)
    }

    /// Full virtual object to create for a host object (backward creation)
    ///
    /// Label keys cannot be recovered from their hashes, so only annotations
    /// listed in the host's manifest are carried over.
    fn to_virtual(
        &self,
        ctx: &TranslateContext<'_>,
        host: &DynamicObject,
        key: &ObjectKey,
    ) -> Result<DynamicObject> {
        let mut obj = DynamicObject::new(&key.name, &ctx.descriptor.api_resource);
        obj.metadata.namespace = key.namespace.clone();

        let synced = manifest(&host.metadata, annotations::MANAGED_ANNOTATIONS);
        let copied: BTreeMap<String, String> = host
            .annotations()
            .iter()
            .filter(|(k, _)| synced.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !copied.is_empty() {
            obj.metadata.annotations = Some(copied);
        }

        obj.data = self.virtual_data(ctx, host, key)?;
        Ok(obj)
    }
}

/// `value` if it is an object, otherwise `{}`
fn object_or_empty(value: &Value) -> Value {
    if value.is_object() {
        value.clone()
    } else {
        json!({})
    }
}

/// Copy of a virtual body without the fields the host owns
fn strip_host_owned(ctx: &TranslateContext<'_>, data: &Value) -> Value {
    let mut data = object_or_empty(data);
    remove_pointer(&mut data, "/status");
    for pointer in &ctx.descriptor.back_sync {
        remove_pointer(&mut data, pointer);
    }
    data
}

/// Translator for kinds whose spec may reference other objects by label
#[derive(Clone, Debug, Default)]
pub struct GenericTranslator {
    label_maps: Vec<&'static str>,
    label_selectors: Vec<&'static str>,
}

impl GenericTranslator {
    /// Translator with no spec rewrites
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite the plain `key: value` selector at `pointer` (e.g. a Service's `/spec/selector`)
    pub fn with_label_map(mut self, pointer: &'static str) -> Self {
        self.label_maps.push(pointer);
        self
    }

    /// Rewrite the `LabelSelector` at `pointer` (e.g. a NetworkPolicy's `/spec/podSelector`)
    pub fn with_label_selector(mut self, pointer: &'static str) -> Self {
        self.label_selectors.push(pointer);
        self
    }

    /// Labels every selector gets so it only matches this instance's objects
    /// from the same virtual namespace
    fn scoping_labels(
        &self,
        ctx: &TranslateContext<'_>,
        virtual_obj: &DynamicObject,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            MARKER_LABEL.to_string(),
            ctx.names().marker_value(&Scope::Namespaced),
        );
        if let Some(ns) = virtual_obj.metadata.namespace.as_deref() {
            labels.insert(NAMESPACE_LABEL.to_string(), ns.to_string());
        }
        labels
    }
}

#[async_trait]
impl KindTranslator for GenericTranslator {
    fn host_data(&self, ctx: &TranslateContext<'_>, virtual_obj: &DynamicObject) -> Result<Value> {
        let mut data = strip_host_owned(ctx, &virtual_obj.data);
        let object = virtual_obj.name_any();
        let kind = &ctx.descriptor.gvk.kind;

        for pointer in &self.label_maps {
            let Some(current) = data.pointer(pointer).filter(|v| v.is_object()) else {
                continue;
            };
            let labels: BTreeMap<String, String> = serde_json::from_value(current.clone())
                .map_err(|e| Error::translation(kind, &object, format!("{pointer}: {e}")))?;
            // selected objects carry translated labels, so the selector must too
            let mut translated = ctx.metadata.host_label_map(&labels, &Scope::Namespaced);
            translated.extend(self.scoping_labels(ctx, virtual_obj));
            set_pointer(&mut data, pointer, serde_json::to_value(translated)?)?;
        }

        for pointer in &self.label_selectors {
            let Some(current) = data.pointer(pointer).filter(|v| v.is_object()) else {
                continue;
            };
            let selector: LabelSelector = serde_json::from_value(current.clone())
                .map_err(|e| Error::translation(kind, &object, format!("{pointer}: {e}")))?;
            let mut translated = ctx
                .metadata
                .host_label_selector(&selector, &Scope::Namespaced);
            translated
                .match_labels
                .get_or_insert_with(BTreeMap::new)
                .extend(self.scoping_labels(ctx, virtual_obj));
            set_pointer(&mut data, pointer, serde_json::to_value(translated)?)?;
        }

        Ok(data)
    }
}

/// Translator for core/v1 Events recorded by host components
///
/// Host event names are `<involved object>.<suffix>`. The virtual event keeps
/// the suffix and points at the virtual counterpart of the involved object;
/// events about objects this instance does not manage map to nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventTranslator;

impl EventTranslator {
    fn split_name(name: &str) -> (&str, Option<&str>) {
        match name.rsplit_once('.') {
            Some((involved, suffix)) if !involved.is_empty() => (involved, Some(suffix)),
            _ => (name, None),
        }
    }
}

#[async_trait]
impl KindTranslator for EventTranslator {
    fn host_key(&self, ctx: &TranslateContext<'_>, key: &ObjectKey) -> ObjectKey {
        let namespace = key.namespace_str();
        let (involved, suffix) = Self::split_name(&key.name);
        let involved = ctx.names().host_name(involved, namespace);
        let name = match suffix {
            Some(suffix) => format!("{involved}.{suffix}"),
            None => involved,
        };
        ObjectKey::namespaced(ctx.names().host_namespace(namespace), name)
    }

    async fn virtual_key(
        &self,
        ctx: &TranslateContext<'_>,
        host: &DynamicObject,
        host_client: &dyn ClusterClient,
    ) -> Result<Option<ObjectKey>> {
        let involved = &host.data["involvedObject"];
        let (Some(api_version), Some(kind), Some(name)) = (
            involved["apiVersion"].as_str(),
            involved["kind"].as_str(),
            involved["name"].as_str(),
        ) else {
            return Ok(None);
        };
        let namespace = involved["namespace"]
            .as_str()
            .or(host.metadata.namespace.as_deref())
            .unwrap_or_default();

        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        let Some(target) = host_client
            .get(&resource, &ObjectKey::namespaced(namespace, name))
            .await?
        else {
            trace!(involved = %name, "involved host object not found");
            return Ok(None);
        };

        let Some(virtual_target) = ctx
            .names()
            .virtual_key_from_annotations(target.annotations())
        else {
            return Ok(None);
        };
        if ctx
            .names()
            .host_name(&virtual_target.name, virtual_target.namespace_str())
            != name
        {
            return Ok(None);
        }

        let event_name = match Self::split_name(&host.name_any()).1 {
            Some(suffix) => format!("{}.{}", virtual_target.name, suffix),
            None => virtual_target.name.clone(),
        };
        Ok(Some(ObjectKey::namespaced(
            virtual_target.namespace_str(),
            event_name,
        )))
    }

    fn virtual_data(
        &self,
        _ctx: &TranslateContext<'_>,
        host: &DynamicObject,
        key: &ObjectKey,
    ) -> Result<Value> {
        let mut data = object_or_empty(&host.data);
        let (involved, _) = Self::split_name(&key.name);
        if let Some(obj) = data.get_mut("involvedObject").and_then(Value::as_object_mut) {
            obj.insert("name".to_string(), json!(involved));
            obj.insert("namespace".to_string(), json!(key.namespace_str()));
            // uid and resourceVersion belong to the host object
            obj.remove("uid");
            obj.remove("resourceVersion");
        }
        Ok(data)
    }
}
