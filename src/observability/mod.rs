//! Observability: log output, structured spans and reconciliation metrics.
//!
//! ## Features
//!
//! - **Logging**: `tracing-subscriber` with an `EnvFilter` and either human or
//!   JSON lines
//! - **Built-in metrics**: Counter, Gauge, Histogram for local tracking
//! - **Structured spans**: one span per pass, one per (cluster, account) unit
//! - **OpenTelemetry** (optional): export to OTLP-compatible backends
//!
//! ## OpenTelemetry Integration
//!
//! ```toml
//! hpc-allocations = { version = "0.1", features = ["otel"] }
//! ```
//!
//! ```rust,ignore
//! use hpc_allocations::observability::{OtelConfig, OtelRuntime};
//!
//! let runtime = OtelRuntime::init(&OtelConfig::from_env())?;
//! // ... run passes ...
//! runtime.shutdown();
//! ```

mod metrics;
#[cfg(feature = "otel")]
mod otel;
mod spans;

pub use metrics::{Counter, Gauge, Histogram, MetricsConfig, MetricsRegistry, MetricsSummary};
#[cfg(feature = "otel")]
pub use otel::{
    OtelConfig, OtelError, OtelRuntime, SERVICE_NAME_DEFAULT, init_tracing_subscriber,
};
pub use spans::{PassSpan, UnitSpan};

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingSettings;

/// Observability configuration combining log output and metrics.
#[derive(Clone, Default)]
pub struct ObservabilityConfig {
    pub logging: LoggingSettings,
    pub metrics: MetricsConfig,
    #[cfg(feature = "otel")]
    pub otel: Option<OtelConfig>,
}

impl ObservabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logging(mut self, settings: LoggingSettings) -> Self {
        self.logging = settings;
        self
    }

    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    #[cfg(feature = "otel")]
    pub fn otel(mut self, config: OtelConfig) -> Self {
        self.otel = Some(config);
        self
    }

    pub fn build_registry(&self) -> Arc<MetricsRegistry> {
        #[cfg(feature = "otel")]
        if let Some(ref otel_config) = self.otel {
            return Arc::new(MetricsRegistry::otel(&self.metrics, otel_config));
        }

        Arc::new(MetricsRegistry::new(&self.metrics))
    }
}

/// `RUST_LOG` when set, otherwise the configured directive.
pub(crate) fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), tracing_subscriber::util::TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(&settings.filter));
    if settings.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    }
}
