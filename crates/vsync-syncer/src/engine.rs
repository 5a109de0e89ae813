//! The per-key reconcile state machine.
//!
//! One reconcile reads a virtual object and its host counterpart, classifies
//! the pair, and issues at most a handful of writes:
//!
//! | virtual | host | action |
//! |---|---|---|
//! | - | - | forget snapshots |
//! | yes | - | create on host, or delete virtually if the host object vanished |
//! | - | yes (managed) | delete on host, or create virtually (host-originated kinds) |
//! | yes | yes | propagate deletions, otherwise three-way merge |
//!
//! The engine never schedules anything itself; it returns a [`SyncOutcome`]
//! and the controller decides when the key runs again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::discovery::Scope;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use vsync_common::events::{actions, reasons};
use vsync_common::metrics::{record_write, ReconcileTimer, Side};
use vsync_common::{
    annotations, Error, EventPublisher, MarkerPolicy, NamespaceMode, NoopEventPublisher,
    ObjectKey, Result, SyncConfig, MARKER_LABEL,
};
use vsync_translate::{MetadataTranslator, OwnershipClassifier, OwnershipPolicy};

use crate::cache::{is_newer, SnapshotStore};
use crate::client::{ClusterClient, DeleteOptions, ListFilter};
use crate::descriptor::KindDescriptor;
use crate::hook::{apply_hook, HookDirection, MutationHook};
use crate::json::set_resource_version;
use crate::patcher::{DesiredState, Patcher, SyncEvent};
use crate::shared::SharedServiceAllocator;
use crate::translator::TranslateContext;

/// Delay before re-checking after removing a host object of an older incarnation
const STALE_INCARNATION_REQUEUE: Duration = Duration::from_secs(1);

/// What the caller should do with the key next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Converged; run again on the next event
    Done,
    /// Run again immediately
    RequeueNow,
    /// Run again after the delay
    RequeueAfter(Duration),
}

/// A reconcile error, with the side whose write failed
#[derive(Debug)]
struct SyncFailure {
    error: Error,
    host_write: bool,
    create: bool,
}

impl SyncFailure {
    fn host(error: Error) -> Self {
        Self {
            error,
            host_write: true,
            create: false,
        }
    }

    /// A host create failure; NotFound here means the target namespace is missing
    fn host_create(error: Error) -> Self {
        Self {
            error,
            host_write: true,
            create: true,
        }
    }
}

impl From<Error> for SyncFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            host_write: false,
            create: false,
        }
    }
}

type StepResult = std::result::Result<SyncOutcome, SyncFailure>;

/// Reconciles virtual objects with their host counterparts
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    metadata: MetadataTranslator,
    ownership: OwnershipClassifier,
    virtual_client: Arc<dyn ClusterClient>,
    host_client: Arc<dyn ClusterClient>,
    snapshots: Arc<SnapshotStore>,
    events: Arc<dyn EventPublisher>,
    hook: Option<Arc<dyn MutationHook>>,
    node_services: Option<Arc<SharedServiceAllocator>>,
    conflicts: DashMap<(String, ObjectKey), u32>,
}

impl SyncEngine {
    /// Engine over the two clusters with no event publishing and no hook
    pub fn new(
        config: Arc<SyncConfig>,
        virtual_client: Arc<dyn ClusterClient>,
        host_client: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            metadata: MetadataTranslator::new(config.clone()),
            ownership: OwnershipClassifier::new(config.clone()),
            config,
            virtual_client,
            host_client,
            snapshots: Arc::new(SnapshotStore::new()),
            events: Arc::new(NoopEventPublisher),
            hook: None,
            node_services: None,
            conflicts: DashMap::new(),
        }
    }

    /// Publish Kubernetes events through `events`
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Run every translated object through `hook` before writing it
    pub fn with_hook(mut self, hook: Arc<dyn MutationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Report per-node Service addresses as pod host IPs
    pub fn with_node_services(mut self, allocator: Arc<SharedServiceAllocator>) -> Self {
        self.node_services = Some(allocator);
        self
    }

    /// Share a snapshot store with other components
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Resolved configuration
    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    /// Metadata translator of this instance
    pub fn metadata(&self) -> &MetadataTranslator {
        &self.metadata
    }

    /// Ownership classifier of this instance
    pub fn ownership(&self) -> &OwnershipClassifier {
        &self.ownership
    }

    /// Virtual cluster client
    pub fn virtual_client(&self) -> &Arc<dyn ClusterClient> {
        &self.virtual_client
    }

    /// Host cluster client
    pub fn host_client(&self) -> &Arc<dyn ClusterClient> {
        &self.host_client
    }

    /// Last converged snapshots
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Whether a host object belongs to this instance under the kind's policy
    pub fn is_managed(&self, descriptor: &KindDescriptor, host: &DynamicObject) -> bool {
        self.ownership.is_managed(
            host,
            &descriptor.gvk,
            &descriptor.scope,
            &descriptor.ownership,
        )
    }

    /// List filter selecting the host objects this instance may own
    ///
    /// Narrowed to the target namespace in single-namespace mode and to the
    /// marker label for kinds using the standard ownership check.
    pub fn host_filter(&self, descriptor: &KindDescriptor) -> ListFilter {
        let namespace = match (&descriptor.scope, &self.config.namespace_mode) {
            (Scope::Namespaced, NamespaceMode::Single { target_namespace }) => {
                Some(target_namespace.clone())
            }
            _ => None,
        };
        let label_selector = matches!(descriptor.ownership, OwnershipPolicy::Standard).then(|| {
            let current = self.metadata.names().marker_value(&descriptor.scope);
            match &self.config.marker_policy {
                MarkerPolicy::AcceptLegacy { values } if !values.is_empty() => format!(
                    "{MARKER_LABEL} in ({current},{})",
                    values.join(",")
                ),
                _ => format!("{MARKER_LABEL}={current}"),
            }
        });
        ListFilter {
            namespace,
            label_selector,
        }
    }

    /// Reconcile the object at `key` (virtual coordinates)
    #[instrument(skip(self, descriptor, key), fields(kind = %descriptor.gvk.kind, object = %key))]
    pub async fn reconcile(
        &self,
        descriptor: &KindDescriptor,
        key: &ObjectKey,
    ) -> Result<SyncOutcome> {
        let timer = ReconcileTimer::start(descriptor.gvk.kind.clone());
        let result = self.reconcile_pair(descriptor, key).await;
        let result = self.handle_result(descriptor, key, result).await;
        timer.finish(match &result {
            Ok(SyncOutcome::Done) => "done",
            Ok(_) => "requeue",
            Err(_) => "error",
        });
        result
    }

    async fn handle_result(
        &self,
        descriptor: &KindDescriptor,
        key: &ObjectKey,
        result: StepResult,
    ) -> Result<SyncOutcome> {
        let conflict_key = (descriptor.kind_key(), key.clone());
        let failure = match result {
            Ok(outcome) => {
                self.conflicts.remove(&conflict_key);
                return Ok(outcome);
            }
            Err(failure) => failure,
        };
        let error = failure.error;

        if error.is_conflict() {
            let mut count = self.conflicts.entry(conflict_key.clone()).or_insert(0);
            *count += 1;
            let attempts = *count;
            drop(count);
            if attempts > self.config.max_conflict_requeues {
                self.conflicts.remove(&conflict_key);
                warn!(attempts, error = %error, "giving up on conflicting writes");
                return Err(error);
            }
            debug!(attempts, "write conflicted, requeueing");
            return Ok(SyncOutcome::RequeueNow);
        }
        self.conflicts.remove(&conflict_key);

        if failure.host_write && error.is_forbidden() {
            warn!(error = %error, "host rejected write");
            self.events
                .publish(
                    &object_reference(descriptor, key, None),
                    EventType::Warning,
                    reasons::SYNC_ERROR,
                    actions::SYNC_TO_HOST,
                    Some(error.to_string()),
                )
                .await;
            return Ok(SyncOutcome::RequeueAfter(descriptor.resync_interval));
        }

        if error.is_not_found() && failure.create {
            warn!(error = %error, "host create target is missing");
            return Err(error);
        }

        if error.is_not_found() {
            debug!("object disappeared during write, requeueing");
            return Ok(SyncOutcome::RequeueNow);
        }

        Err(error)
    }

    async fn reconcile_pair(&self, descriptor: &KindDescriptor, key: &ObjectKey) -> StepResult {
        let ctx = TranslateContext::new(descriptor, &self.metadata);
        let kind = descriptor.kind_key();
        let host_key = descriptor.translator.host_key(&ctx, key);

        let virtual_obj = self
            .virtual_client
            .get(&descriptor.api_resource, key)
            .await?;
        let host_obj = self
            .host_client
            .get(&descriptor.api_resource, &host_key)
            .await?;
        let virtual_before = self.snapshots.virtual_object(&kind, key);
        let host_before = self.snapshots.host_object(&kind, key);

        if is_stale(virtual_before.as_ref(), virtual_obj.as_ref())
            || is_stale(host_before.as_ref(), host_obj.as_ref())
        {
            debug!("read is older than the last write, requeueing");
            return Ok(SyncOutcome::RequeueNow);
        }

        match (virtual_obj, host_obj) {
            (None, None) => {
                self.snapshots.forget(&kind, key);
                Ok(SyncOutcome::Done)
            }
            (Some(virtual_obj), None) => {
                self.virtual_only(&ctx, key, &host_key, virtual_obj, host_before)
                    .await
            }
            (None, Some(host)) => self.host_only(&ctx, key, host, virtual_before).await,
            (Some(virtual_obj), Some(host)) => {
                self.both(&ctx, key, &host_key, virtual_obj, host, virtual_before, host_before)
                    .await
            }
        }
    }

    async fn virtual_only(
        &self,
        ctx: &TranslateContext<'_>,
        key: &ObjectKey,
        host_key: &ObjectKey,
        virtual_obj: DynamicObject,
        host_before: Option<DynamicObject>,
    ) -> StepResult {
        let descriptor = ctx.descriptor;
        let kind = descriptor.kind_key();

        if host_before.is_some() {
            // the cache may not have seen our own create yet
            if let Some(host) = self
                .host_client
                .get_live(&descriptor.api_resource, host_key)
                .await?
            {
                self.snapshots.record_host(&kind, key, &host);
                return Ok(SyncOutcome::RequeueNow);
            }
            let out_of_band = virtual_obj.metadata.deletion_timestamp.is_none();
            if out_of_band {
                info!(host = %host_key, "host object deleted out of band, deleting virtual object");
            }
            self.delete_virtual_now(descriptor, key, &virtual_obj).await?;
            if out_of_band {
                self.events
                    .publish(
                        &object_reference(descriptor, key, virtual_obj.uid()),
                        EventType::Normal,
                        reasons::HOST_DELETED,
                        actions::DELETE,
                        Some(format!("host object {host_key} was deleted")),
                    )
                    .await;
            }
            self.snapshots.forget(&kind, key);
            return Ok(SyncOutcome::Done);
        }

        if virtual_obj.metadata.deletion_timestamp.is_some() {
            debug!("virtual object is deleting and has no host object, finalizing");
            self.delete_virtual_now(descriptor, key, &virtual_obj).await?;
            self.snapshots.forget(&kind, key);
            return Ok(SyncOutcome::Done);
        }

        if !descriptor.sync_to_host {
            return Ok(SyncOutcome::Done);
        }

        let host = descriptor.translator.to_host(ctx, &virtual_obj)?;
        let host = self.mutate(HookDirection::ToHost, descriptor, host).await?;
        match self
            .host_client
            .create(&descriptor.api_resource, &host)
            .await
        {
            Ok(created) => {
                record_write(Side::Host, "create");
                info!(host = %host_key, "created host object");
                self.snapshots.record_virtual(&kind, key, &virtual_obj);
                self.snapshots.record_host(&kind, key, &created);
                Ok(SyncOutcome::Done)
            }
            Err(e) if e.is_already_exists() => {
                // the host read may be filtered to managed objects only
                let existing = self
                    .host_client
                    .get_live(&descriptor.api_resource, host_key)
                    .await?;
                match existing {
                    Some(existing) if !self.is_managed(descriptor, &existing) => {
                        self.report_foreign(descriptor, key, &virtual_obj, host_key)
                            .await;
                        Ok(SyncOutcome::RequeueAfter(descriptor.resync_interval))
                    }
                    _ => {
                        debug!(host = %host_key, "host object appeared concurrently");
                        Ok(SyncOutcome::RequeueNow)
                    }
                }
            }
            Err(e) => Err(SyncFailure::host_create(e)),
        }
    }

    async fn host_only(
        &self,
        ctx: &TranslateContext<'_>,
        key: &ObjectKey,
        host: DynamicObject,
        virtual_before: Option<DynamicObject>,
    ) -> StepResult {
        let descriptor = ctx.descriptor;
        let kind = descriptor.kind_key();

        if !self.is_managed(descriptor, &host) {
            debug!(host = %host.name_any(), "host object is not managed, ignoring");
            return Ok(SyncOutcome::Done);
        }
        if host.metadata.deletion_timestamp.is_some() {
            return Ok(SyncOutcome::Done);
        }

        if virtual_before.is_some() || !descriptor.create_virtual {
            if let Some(virtual_obj) = self
                .virtual_client
                .get_live(&descriptor.api_resource, key)
                .await?
            {
                self.snapshots.record_virtual(&kind, key, &virtual_obj);
                return Ok(SyncOutcome::RequeueNow);
            }
            info!(host = %host.name_any(), "virtual object deleted, deleting host object");
            self.host_client
                .delete(
                    &descriptor.api_resource,
                    &ObjectKey::from_object(&host),
                    &DeleteOptions::graceful(None, host.uid()),
                )
                .await
                .map_err(SyncFailure::host)?;
            record_write(Side::Host, "delete");
            self.snapshots.forget(&kind, key);
            return Ok(SyncOutcome::Done);
        }

        let virtual_obj = descriptor.translator.to_virtual(ctx, &host, key)?;
        let virtual_obj = self
            .mutate(HookDirection::ToVirtual, descriptor, virtual_obj)
            .await?;
        match self
            .virtual_client
            .create(&descriptor.api_resource, &virtual_obj)
            .await
        {
            Ok(created) => {
                record_write(Side::Virtual, "create");
                info!("created virtual object from host object");
                self.snapshots.record_virtual(&kind, key, &created);
                self.snapshots.record_host(&kind, key, &host);
                Ok(SyncOutcome::Done)
            }
            Err(e) if e.is_already_exists() => Ok(SyncOutcome::RequeueNow),
            Err(e) => Err(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn both(
        &self,
        ctx: &TranslateContext<'_>,
        key: &ObjectKey,
        host_key: &ObjectKey,
        virtual_obj: DynamicObject,
        host: DynamicObject,
        virtual_before: Option<DynamicObject>,
        host_before: Option<DynamicObject>,
    ) -> StepResult {
        let descriptor = ctx.descriptor;
        let kind = descriptor.kind_key();

        if !self.is_managed(descriptor, &host) {
            self.report_foreign(descriptor, key, &virtual_obj, host_key)
                .await;
            return Ok(SyncOutcome::RequeueAfter(descriptor.resync_interval));
        }

        if descriptor.sync_to_host && is_previous_incarnation(&virtual_obj, &host) {
            if host.metadata.deletion_timestamp.is_some() {
                debug!(host = %host_key, "previous incarnation is still terminating");
                return Ok(SyncOutcome::RequeueAfter(STALE_INCARNATION_REQUEUE));
            }
            info!(host = %host_key, "host object belongs to a previous incarnation, deleting it");
            self.host_client
                .delete(
                    &descriptor.api_resource,
                    host_key,
                    &DeleteOptions::immediate(host.uid()),
                )
                .await
                .map_err(SyncFailure::host)?;
            record_write(Side::Host, "delete");
            self.snapshots.forget_host(&kind, key);
            return Ok(SyncOutcome::RequeueAfter(STALE_INCARNATION_REQUEUE));
        }

        let host_deleting = host.metadata.deletion_timestamp.is_some();
        let virtual_deleting = virtual_obj.metadata.deletion_timestamp.is_some();

        if host_deleting && !virtual_deleting {
            info!(host = %host_key, "host object is deleting, deleting virtual object");
            if descriptor.has_status {
                self.mirror_status(descriptor, key, &virtual_obj, &host).await?;
            }
            self.virtual_client
                .delete(
                    &descriptor.api_resource,
                    key,
                    &DeleteOptions::graceful(
                        host.metadata.deletion_grace_period_seconds,
                        virtual_obj.uid(),
                    ),
                )
                .await?;
            record_write(Side::Virtual, "delete");
            self.snapshots.record_host(&kind, key, &host);
            return Ok(SyncOutcome::Done);
        }

        if virtual_deleting {
            if !host_deleting {
                info!(host = %host_key, "virtual object is deleting, deleting host object");
                self.host_client
                    .delete(
                        &descriptor.api_resource,
                        host_key,
                        &DeleteOptions::graceful(
                            virtual_obj.metadata.deletion_grace_period_seconds,
                            host.uid(),
                        ),
                    )
                    .await
                    .map_err(SyncFailure::host)?;
                record_write(Side::Host, "delete");
            } else if descriptor.has_status {
                self.mirror_status(descriptor, key, &virtual_obj, &host).await?;
            }
            self.snapshots.record_host(&kind, key, &host);
            return Ok(SyncOutcome::Done);
        }

        self.converge(ctx, key, host_key, virtual_obj, host, virtual_before, host_before)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn converge(
        &self,
        ctx: &TranslateContext<'_>,
        key: &ObjectKey,
        host_key: &ObjectKey,
        virtual_obj: DynamicObject,
        host: DynamicObject,
        virtual_before: Option<DynamicObject>,
        host_before: Option<DynamicObject>,
    ) -> StepResult {
        let descriptor = ctx.descriptor;
        let kind = descriptor.kind_key();
        let event = SyncEvent {
            virtual_before: virtual_before.as_ref(),
            virtual_obj: &virtual_obj,
            host_before: host_before.as_ref(),
            host: &host,
        };

        let mut desired = if descriptor.sync_to_host {
            Patcher::desired(ctx, &event)?
        } else {
            Patcher::desired_from_host(ctx, &event)?
        };
        if descriptor.reports_node_ip {
            self.report_node_ip(&host, &mut desired)
                .await
                .map_err(SyncFailure::host)?;
        }
        let mut plan = Patcher::plan(&event, &desired);
        if self.hook.is_some() && (plan.host.is_some() || plan.virtual_object.is_some()) {
            if plan.host.is_some() {
                desired.host = self
                    .mutate(HookDirection::ToHost, descriptor, desired.host)
                    .await?;
            }
            if plan.virtual_object.is_some() {
                desired.virtual_obj = self
                    .mutate(HookDirection::ToVirtual, descriptor, desired.virtual_obj)
                    .await?;
            }
            plan = Patcher::plan(&event, &desired);
        }

        if plan.is_empty() {
            self.snapshots.record_virtual(&kind, key, &virtual_obj);
            self.snapshots.record_host(&kind, key, &host);
            return Ok(SyncOutcome::Done);
        }

        match &plan.host {
            Some(patch) => {
                debug!(host = %host_key, "patching host object");
                let updated = self
                    .host_client
                    .patch(&descriptor.api_resource, host_key, patch)
                    .await
                    .map_err(SyncFailure::host)?;
                record_write(Side::Host, "patch");
                self.snapshots.record_host(&kind, key, &updated);
            }
            None => self.snapshots.record_host(&kind, key, &host),
        }

        let mut current_virtual = virtual_obj;
        if let Some(patch) = &plan.virtual_object {
            debug!("patching virtual object");
            current_virtual = self
                .virtual_client
                .patch(&descriptor.api_resource, key, patch)
                .await?;
            record_write(Side::Virtual, "patch");
        }
        if let Some(status) = &plan.virtual_status {
            debug!("updating virtual status");
            let mut patch = status.clone();
            if let Some(rv) = current_virtual.resource_version() {
                set_resource_version(&mut patch, &rv);
            }
            current_virtual = self
                .virtual_client
                .patch_status(&descriptor.api_resource, key, &patch)
                .await?;
            record_write(Side::Virtual, "status");
        }
        self.snapshots.record_virtual(&kind, key, &current_virtual);

        Ok(SyncOutcome::Done)
    }

    /// Point the desired virtual status at the shared Service of the pod's node
    async fn report_node_ip(&self, host: &DynamicObject, desired: &mut DesiredState) -> Result<()> {
        let Some(allocator) = &self.node_services else {
            return Ok(());
        };
        let Some(node) = host
            .data
            .pointer("/spec/nodeName")
            .and_then(Value::as_str)
            .filter(|node| !node.is_empty())
        else {
            return Ok(());
        };
        let Some(status) = desired
            .virtual_status
            .as_mut()
            .and_then(Value::as_object_mut)
            .filter(|status| status.contains_key("hostIP"))
        else {
            return Ok(());
        };
        let Some(ip) = allocator.node_ip(node).await? else {
            debug!(node, "node service has no cluster IP yet");
            return Ok(());
        };
        status.insert("hostIP".to_string(), json!(ip));
        if status.contains_key("hostIPs") {
            status.insert("hostIPs".to_string(), json!([{ "ip": ip }]));
        }
        Ok(())
    }

    async fn report_foreign(
        &self,
        descriptor: &KindDescriptor,
        key: &ObjectKey,
        virtual_obj: &DynamicObject,
        host_key: &ObjectKey,
    ) {
        warn!(host = %host_key, "host object exists but is not managed by this instance");
        self.events
            .publish(
                &object_reference(descriptor, key, virtual_obj.uid()),
                EventType::Warning,
                reasons::SYNC_WARNING,
                actions::SYNC_TO_HOST,
                Some(format!(
                    "host object {host_key} already exists and is not managed by this virtual cluster"
                )),
            )
            .await;
    }

    /// Copy the host status onto the virtual object
    async fn mirror_status(
        &self,
        descriptor: &KindDescriptor,
        key: &ObjectKey,
        virtual_obj: &DynamicObject,
        host: &DynamicObject,
    ) -> Result<()> {
        let Some(status) = host.data.get("status") else {
            return Ok(());
        };
        if virtual_obj.data.get("status") == Some(status) {
            return Ok(());
        }
        let mut patch = json!({ "status": status });
        if let Some(rv) = virtual_obj.resource_version() {
            set_resource_version(&mut patch, &rv);
        }
        self.virtual_client
            .patch_status(&descriptor.api_resource, key, &patch)
            .await?;
        record_write(Side::Virtual, "status");
        Ok(())
    }

    /// Strip finalizers and delete the virtual object with no grace period
    async fn delete_virtual_now(
        &self,
        descriptor: &KindDescriptor,
        key: &ObjectKey,
        virtual_obj: &DynamicObject,
    ) -> Result<()> {
        if !virtual_obj.finalizers().is_empty() {
            let mut patch = json!({ "metadata": { "finalizers": null } });
            if let Some(rv) = virtual_obj.resource_version() {
                set_resource_version(&mut patch, &rv);
            }
            match self
                .virtual_client
                .patch(&descriptor.api_resource, key, &patch)
                .await
            {
                Ok(_) => record_write(Side::Virtual, "patch"),
                // removing the last finalizer of a deleting object removes the object
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        self.virtual_client
            .delete(
                &descriptor.api_resource,
                key,
                &DeleteOptions::immediate(virtual_obj.uid()),
            )
            .await?;
        record_write(Side::Virtual, "delete");
        Ok(())
    }

    async fn mutate(
        &self,
        direction: HookDirection,
        descriptor: &KindDescriptor,
        obj: DynamicObject,
    ) -> Result<DynamicObject> {
        match &self.hook {
            Some(hook) => apply_hook(hook.as_ref(), direction, &descriptor.gvk, obj).await,
            None => Ok(obj),
        }
    }
}

/// A snapshot newer than what was just read means the read came from a lagging cache
fn is_stale(snapshot: Option<&DynamicObject>, read: Option<&DynamicObject>) -> bool {
    match (snapshot, read) {
        (Some(snapshot), Some(read)) => snapshot.uid() == read.uid() && is_newer(snapshot, read),
        _ => false,
    }
}

/// The host object was created for an earlier virtual object of the same name
fn is_previous_incarnation(virtual_obj: &DynamicObject, host: &DynamicObject) -> bool {
    match (
        host.annotations().get(annotations::OBJECT_UID),
        virtual_obj.metadata.uid.as_ref(),
    ) {
        (Some(host_uid), Some(virtual_uid)) => host_uid != virtual_uid,
        _ => false,
    }
}

fn object_reference(
    descriptor: &KindDescriptor,
    key: &ObjectKey,
    uid: Option<String>,
) -> ObjectReference {
    ObjectReference {
        api_version: Some(descriptor.api_resource.api_version.clone()),
        kind: Some(descriptor.gvk.kind.clone()),
        name: Some(key.name.clone()),
        namespace: key.namespace.clone(),
        uid,
        ..Default::default()
    }
}
