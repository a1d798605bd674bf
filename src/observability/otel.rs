//! OTLP/HTTP export of reconciliation traces and metrics.

use std::time::Duration;

use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::env_filter;
use crate::config::LoggingSettings;

pub const SERVICE_NAME_DEFAULT: &str = "su-reconcile";

/// OTLP export settings.
#[derive(Debug, Clone)]
pub struct OtelConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub otlp_endpoint: String,
    pub traces_enabled: bool,
    pub metrics_enabled: bool,
    pub metrics_export_interval: Duration,
    pub sample_ratio: f64,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_DEFAULT.to_string(),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: "http://localhost:4318".to_string(),
            traces_enabled: true,
            metrics_enabled: true,
            metrics_export_interval: Duration::from_secs(60),
            sample_ratio: 1.0,
        }
    }
}

impl OtelConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_traces(mut self, enabled: bool) -> Self {
        self.traces_enabled = enabled;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_export_interval = interval;
        self
    }

    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.sample_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = endpoint;
        }

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG")
            && let Ok(r) = ratio.parse::<f64>()
        {
            config.sample_ratio = r.clamp(0.0, 1.0);
        }

        config
    }

    fn sampler(&self) -> Sampler {
        if self.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_ratio)
        }
    }

    fn build_resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new(SERVICE_NAME, self.service_name.clone())];

        if let Some(ref version) = self.service_version {
            attributes.push(KeyValue::new(SERVICE_VERSION, version.clone()));
        }

        Resource::builder().with_attributes(attributes).build()
    }
}

/// Tracer and meter providers. Call `shutdown()` before exit to flush.
pub struct OtelRuntime {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl OtelRuntime {
    /// Initialize OpenTelemetry with the given configuration.
    pub fn init(config: &OtelConfig) -> Result<Self, OtelError> {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let resource = config.build_resource();

        let tracer_provider = if config.traces_enabled {
            Some(Self::init_tracer(config, resource.clone())?)
        } else {
            None
        };

        let meter_provider = if config.metrics_enabled {
            Some(Self::init_metrics(config, resource)?)
        } else {
            None
        };

        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }

    fn init_tracer(
        config: &OtelConfig,
        resource: Resource,
    ) -> Result<SdkTracerProvider, OtelError> {
        let exporter = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}/v1/traces", config.otlp_endpoint))
            .build()
            .map_err(|e| OtelError::Init(format!("Failed to create span exporter: {}", e)))?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(config.sampler())
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build();

        global::set_tracer_provider(provider.clone());

        Ok(provider)
    }

    fn init_metrics(
        config: &OtelConfig,
        resource: Resource,
    ) -> Result<SdkMeterProvider, OtelError> {
        let exporter = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}/v1/metrics", config.otlp_endpoint))
            .build()
            .map_err(|e| OtelError::Init(format!("Failed to create metric exporter: {}", e)))?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(config.metrics_export_interval)
            .build();

        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build();

        global::set_meter_provider(provider.clone());

        Ok(provider)
    }

    /// Get the global meter for recording metrics.
    pub fn meter(&self, name: &'static str) -> opentelemetry::metrics::Meter {
        global::meter(name)
    }

    /// Shutdown the OpenTelemetry runtime, flushing any pending data.
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!("Failed to shutdown tracer provider: {:?}", e);
        }

        if let Some(provider) = self.meter_provider
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}

/// Install the global subscriber with the OTLP trace layer on top of the
/// configured log output.
pub fn init_tracing_subscriber(
    config: &OtelConfig,
    logging: &LoggingSettings,
) -> Result<(), OtelError> {
    let resource = config.build_resource();

    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/traces", config.otlp_endpoint))
        .build()
        .map_err(|e| OtelError::Init(format!("Failed to create span exporter: {}", e)))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider);

    let otel_layer = OpenTelemetryLayer::new(global::tracer(SERVICE_NAME_DEFAULT));
    let registry = tracing_subscriber::registry()
        .with(env_filter(&logging.filter))
        .with(otel_layer);

    let result = if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.map_err(|e| OtelError::Init(format!("Failed to init subscriber: {}", e)))
}

/// Errors that can occur during OpenTelemetry initialization.
#[derive(Debug, thiserror::Error)]
pub enum OtelError {
    #[error("OpenTelemetry initialization failed: {0}")]
    Init(String),

    #[error("OpenTelemetry export failed: {0}")]
    Export(String),
}

/// Mirrors [`MetricsRegistry`](super::MetricsRegistry) updates into OTel
/// instruments.
pub struct OtelMetricsBridge {
    passes: opentelemetry::metrics::Counter<u64>,
    units_started: opentelemetry::metrics::Counter<u64>,
    units_succeeded: opentelemetry::metrics::Counter<u64>,
    units_failed: opentelemetry::metrics::Counter<u64>,
    units_timed_out: opentelemetry::metrics::Counter<u64>,
    units_in_flight: opentelemetry::metrics::UpDownCounter<i64>,
    unit_latency: opentelemetry::metrics::Histogram<f64>,
    allocations_closed: opentelemetry::metrics::Counter<u64>,
    su_apportioned: opentelemetry::metrics::Counter<u64>,
    limits_pushed: opentelemetry::metrics::Counter<u64>,
}

impl OtelMetricsBridge {
    pub fn new(meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            passes: meter
                .u64_counter("su.reconcile.passes")
                .with_description("Scheduling passes started")
                .build(),
            units_started: meter
                .u64_counter("su.reconcile.units.started")
                .with_description("Units dispatched")
                .build(),
            units_succeeded: meter
                .u64_counter("su.reconcile.units.succeeded")
                .with_description("Units that reconciled, locked or skipped a reserved account")
                .build(),
            units_failed: meter
                .u64_counter("su.reconcile.units.failed")
                .with_description("Units that ended in an error")
                .build(),
            units_timed_out: meter
                .u64_counter("su.reconcile.units.timed_out")
                .with_description("Units abandoned on timeout")
                .build(),
            units_in_flight: meter
                .i64_up_down_counter("su.reconcile.units.in_flight")
                .with_description("Units currently running")
                .build(),
            unit_latency: meter
                .f64_histogram("su.reconcile.unit.latency")
                .with_description("Unit wall time in milliseconds")
                .with_unit("ms")
                .build(),
            allocations_closed: meter
                .u64_counter("su.reconcile.allocations.closed")
                .with_description("Allocations closed out with a final usage")
                .build(),
            su_apportioned: meter
                .u64_counter("su.reconcile.su.apportioned")
                .with_description("Service units frozen into final usage")
                .with_unit("SU")
                .build(),
            limits_pushed: meter
                .u64_counter("su.reconcile.limits.pushed")
                .with_description("Limits written to the accounting system")
                .build(),
        }
    }

    pub fn record_pass(&self) {
        self.passes.add(1, &[]);
    }

    pub fn record_unit_start(&self) {
        self.units_started.add(1, &[]);
        self.units_in_flight.add(1, &[]);
    }

    pub fn record_unit_end(&self, success: bool, latency_ms: f64) {
        self.units_in_flight.add(-1, &[]);
        self.unit_latency.record(latency_ms, &[]);
        if success {
            self.units_succeeded.add(1, &[]);
        } else {
            self.units_failed.add(1, &[]);
        }
    }

    pub fn record_unit_timeout(&self, latency_ms: f64) {
        self.units_in_flight.add(-1, &[]);
        self.unit_latency.record(latency_ms, &[]);
        self.units_timed_out.add(1, &[]);
    }

    pub fn record_close(&self, final_usage: u64) {
        self.allocations_closed.add(1, &[]);
        self.su_apportioned.add(final_usage, &[]);
    }

    pub fn record_limit_pushed(&self) {
        self.limits_pushed.add(1, &[]);
    }
}
