//! Logging and OTLP export for one operator replica
//!
//! Logs are always JSON on stdout. When an OTLP endpoint is configured, the
//! metrics in [`crate::metrics`] and the spans around reconciles and gate
//! decisions are exported with the replica's identity as resource attributes.
//! The returned [`TelemetryGuard`] flushes both pipelines when dropped.

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
pub const DEFAULT_LOG_FILTER: &str = "info,buildconfig=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// traces or metrics
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Who is reporting and where to
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` resource attribute and tracer name
    pub service_name: String,
    /// Replica id, exported as `k8s.pod.name`
    pub replica_id: String,
    /// Replica namespace, exported as `k8s.namespace.name`
    pub namespace: String,
    /// OTLP gRPC endpoint; logs only when None
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Telemetry for one operator replica
    pub fn for_replica(
        replica_id: impl Into<String>,
        namespace: impl Into<String>,
        otlp_endpoint: Option<String>,
    ) -> Self {
        Self {
            service_name: "buildconfig-operator".to_string(),
            replica_id: replica_id.into(),
            namespace: namespace.into(),
            otlp_endpoint: otlp_endpoint.filter(|e| !e.is_empty()),
        }
    }

    fn resource(&self) -> Resource {
        Resource::new([
            KeyValue::new(SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("k8s.pod.name", self.replica_id.clone()),
            KeyValue::new("k8s.namespace.name", self.namespace.clone()),
        ])
    }
}

/// Flushes and shuts down the OTLP pipelines on drop
#[derive(Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether spans and metrics leave the process
    pub fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush traces: {e}");
            }
        }
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global subscriber and, if configured, the OTLP pipelines
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let mut guard = TelemetryGuard::default();

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = config.resource();

            let meter_provider = meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter_provider.clone());
            guard.meter_provider = Some(meter_provider);

            let tracer_provider = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracer_provider.clone());
            let tracer = tracer_provider.tracer(config.service_name.clone());
            guard.tracer_provider = Some(tracer_provider);

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true),
        )
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(guard)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;

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
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{Key, Value};

    #[test]
    fn resource_identifies_the_replica() {
        let config = TelemetryConfig::for_replica("buildconfig-operator-1", "buildconfig-system", None);
        let resource = config.resource();
        assert_eq!(
            resource.get(Key::new("k8s.pod.name")),
            Some(Value::from("buildconfig-operator-1"))
        );
        assert_eq!(
            resource.get(Key::new("k8s.namespace.name")),
            Some(Value::from("buildconfig-system"))
        );
        assert_eq!(
            resource.get(Key::new(SERVICE_NAME)),
            Some(Value::from("buildconfig-operator"))
        );
    }

    #[test]
    fn empty_endpoint_means_logs_only() {
        let config = TelemetryConfig::for_replica("pod-a", "ns", Some(String::new()));
        assert!(config.otlp_endpoint.is_none());
        assert!(!TelemetryGuard::default().is_exporting());
    }

    #[test]
    fn default_filter_quiets_http_stack() {
        assert!(DEFAULT_LOG_FILTER.contains("hyper=warn"));
        assert!(DEFAULT_LOG_FILTER.contains("buildconfig=debug"));
    }
}
