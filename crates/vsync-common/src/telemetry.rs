//! Log and OTLP export setup for the syncer process
//!
//! Logs go to stdout as JSON lines. With an OTLP endpoint configured, spans
//! and the instruments in [`crate::metrics`] are exported as well, and the
//! returned [`TelemetryGuard`] flushes both pipelines when dropped.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,vsync_syncer=debug,kube=info,hyper=warn";

const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("otlp {signal} exporter: {message}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Exporter error text
        message: String,
    },

    /// A global subscriber was already installed
    #[error("tracing subscriber: {0}")]
    Subscriber(String),
}

/// What to export and how to label it
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` of exported spans and metrics
    pub service_name: String,
    /// Virtual cluster the process syncs, exported as `vsync.instance`
    pub instance_name: String,
    /// OTLP collector; stdout logging only when `None`
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Config for `instance_name`, reading the collector from the standard OTLP variable
    pub fn from_env(instance_name: impl Into<String>) -> Self {
        Self {
            service_name: "vsync-syncer".to_string(),
            instance_name: instance_name.into(),
            otlp_endpoint: std::env::var(ENDPOINT_ENV).ok().filter(|e| !e.is_empty()),
        }
    }

    fn resource(&self) -> Resource {
        Resource::new([
            KeyValue::new(SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("vsync.instance", self.instance_name.clone()),
        ])
    }
}

/// Keeps the export pipelines alive; flushes them on drop
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            if let Err(e) = tracer.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(meter) = self.meter.take() {
            if let Err(e) = meter.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global subscriber, plus OTLP export when an endpoint is set
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let mut guard = TelemetryGuard::default();
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = config.resource();
            let meter = meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter.clone());
            guard.meter = Some(meter);

            let tracer = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracer.clone());
            let layer = tracing_opentelemetry::layer()
                .with_tracer(tracer.tracer(config.service_name.clone()));
            guard.tracer = Some(tracer);
            Some(layer)
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;
    Ok(guard)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("traces", e))?;
    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metrics", e))?;
    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}

fn exporter_error(signal: &'static str, error: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Exporter {
        signal,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_the_instance() {
        let config = TelemetryConfig {
            service_name: "vsync-test".to_string(),
            instance_name: "tenant-a".to_string(),
            otlp_endpoint: None,
        };
        let resource = config.resource();
        assert!(resource
            .iter()
            .any(|(k, v)| k.as_str() == "vsync.instance" && v.as_str() == "tenant-a"));
        assert!(resource
            .iter()
            .any(|(k, v)| k.as_str() == SERVICE_NAME && v.as_str() == "vsync-test"));
    }

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn empty_guard_drops_quietly() {
        drop(TelemetryGuard::default());
    }
}
