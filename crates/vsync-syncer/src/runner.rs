//! Wires controllers for every enabled kind against two live clusters.
//!
//! Startup verifies that both clusters serve every enabled kind, then spawns
//! one [`SyncController`] and one [`Sweeper`] per kind. The virtual side is
//! watched by kube's controller itself; the host side by a reflector whose
//! events are mapped back onto virtual keys. All tasks share the
//! caller's cancellation token; the first controller error cancels the rest.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::discovery::pinned_kind;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vsync_common::retry::{retry_with_backoff, RetryConfig};
use vsync_common::telemetry::{init_telemetry, TelemetryConfig};
use vsync_common::{Error, KubeEventPublisher, Result, SyncConfig};

use crate::cache::ReadCache;
use crate::client::{KubeClusterClient, ListFilter};
use crate::controller::{ObjectStream, SyncController};
use crate::descriptor::{DescriptorRegistry, KindDescriptor};
use crate::engine::SyncEngine;
use crate::hook::MutationHook;
use crate::shared::SharedServiceAllocator;
use crate::sweeper::Sweeper;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Reporting controller name on published events
const EVENT_CONTROLLER: &str = "vsync-syncer";

/// Process entry point: install telemetry, then sync until ctrl-c
///
/// The telemetry pipelines are flushed after every controller has stopped.
pub async fn run(
    config: Arc<SyncConfig>,
    virtual_client: Client,
    host_client: Client,
    hook: Option<Arc<dyn MutationHook>>,
) -> Result<()> {
    let _telemetry = init_telemetry(&TelemetryConfig::from_env(config.instance_name.clone()))
        .map_err(|e| Error::setup(format!("telemetry: {e}")))?;
    info!(
        instance = %config.instance_name,
        namespace = %config.current_namespace,
        "starting vsync syncer"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for interrupt");
            return;
        }
        info!("interrupt received, stopping controllers");
        on_signal.cancel();
    });

    run_sync_controllers(config, virtual_client, host_client, hook, cancel).await
}

/// Run every enabled kind's controller until `cancel` fires
///
/// Returns an [`Error::Setup`] when a kind is not served by either cluster,
/// or the first error a controller stops with.
pub async fn run_sync_controllers(
    config: Arc<SyncConfig>,
    virtual_client: Client,
    host_client: Client,
    hook: Option<Arc<dyn MutationHook>>,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = DescriptorRegistry::from_config(&config)?;
    for descriptor in registry.iter() {
        ensure_served(&virtual_client, descriptor, "virtual").await?;
        ensure_served(&host_client, descriptor, "host").await?;
    }

    let virtual_clusters = Arc::new(KubeClusterClient::new(
        virtual_client.clone(),
        config.field_manager.clone(),
    ));
    let host_clusters = Arc::new(KubeClusterClient::new(
        host_client.clone(),
        config.field_manager.clone(),
    ));
    let mut engine = SyncEngine::new(
        config.clone(),
        virtual_clusters.clone(),
        host_clusters.clone(),
    )
    .with_events(Arc::new(KubeEventPublisher::new(
        virtual_client.clone(),
        EVENT_CONTROLLER,
    )));
    if let Some(hook) = hook {
        engine = engine.with_hook(hook);
    }
    if let Some(selector) = &config.node_service_selector {
        engine = engine.with_node_services(Arc::new(SharedServiceAllocator::new(
            config.clone(),
            host_clusters.clone(),
            selector.clone(),
        )));
    }
    let engine = Arc::new(engine);

    let mut tasks = JoinSet::new();
    for descriptor in registry.iter() {
        let ar = &descriptor.api_resource;
        let controller = Controller::new_with(
            Api::all_with(virtual_client.clone(), ar),
            watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
            ar.clone(),
        );
        let virtual_cache = Arc::new(ReadCache::from_store(ar.clone(), controller.store()));
        let (host_cache, host_writer) = ReadCache::new(ar.clone());
        let host_cache = Arc::new(host_cache);
        virtual_clusters.attach_cache(virtual_cache.clone());
        host_clusters.attach_cache(host_cache.clone());

        let host_filter = engine.host_filter(descriptor);
        let host_events = watch_objects(
            host_api(&host_client, ar, &host_filter),
            host_filter.label_selector.as_deref(),
            host_writer,
        );

        let sync = SyncController::with_caches(
            descriptor.clone(),
            engine.clone(),
            vec![virtual_cache, host_cache],
        );
        let sweeper = Sweeper::new(descriptor.clone(), engine.clone(), sync.requeue());

        info!(kind = %descriptor.kind_key(), "- sync controller");
        let run_cancel = cancel.clone();
        tasks.spawn(async move {
            sync.run(controller, host_events, run_cancel).await;
            Ok::<(), Error>(())
        });
        let sweep_cancel = cancel.clone();
        tasks.spawn(async move {
            sweeper.run(sweep_cancel).await;
            Ok(())
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| {
            Error::internal_with_context("runner", format!("controller task panicked: {e}"))
        });
        if let Err(e) = result.and_then(|r| r) {
            error!(error = %e, "controller stopped with error, shutting down");
            cancel.cancel();
            first_error.get_or_insert(e);
        }
    }
    info!("all sync controllers stopped");
    first_error.map_or(Ok(()), Err)
}

/// Fail startup unless `client` serves the descriptor's kind with the expected scope
async fn ensure_served(client: &Client, descriptor: &KindDescriptor, side: &str) -> Result<()> {
    let (resource, capabilities) = retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "discover_kind",
        move || pinned_kind(client, &descriptor.gvk),
    )
    .await
    .map_err(|e| {
        Error::setup(format!(
            "{side} cluster does not serve {}: {e}",
            descriptor.kind_key()
        ))
    })?;
    if capabilities.scope != descriptor.scope {
        return Err(Error::setup(format!(
            "{side} cluster serves {} with unexpected scope {:?}",
            descriptor.kind_key(),
            capabilities.scope
        )));
    }
    if resource.plural != descriptor.api_resource.plural {
        warn!(
            kind = %descriptor.kind_key(),
            served = %resource.plural,
            expected = %descriptor.api_resource.plural,
            side,
            "cluster serves kind under a different plural"
        );
    }
    Ok(())
}

fn host_api(client: &Client, resource: &ApiResource, filter: &ListFilter) -> Api<DynamicObject> {
    match &filter.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
        None => Api::all_with(client.clone(), resource),
    }
}

/// Host watch stream that feeds `writer` and yields every touched object
fn watch_objects(
    api: Api<DynamicObject>,
    label_selector: Option<&str>,
    writer: Writer<DynamicObject>,
) -> ObjectStream {
    let mut config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(selector) = label_selector {
        config = config.labels(selector);
    }
    watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!(error = %e, "watch error");
                    None
                }
            }
        })
        .boxed()
}
