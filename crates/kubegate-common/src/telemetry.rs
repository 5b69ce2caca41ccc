//! Logging, tracing and metrics export
//!
//! [`init_telemetry`] installs the process-wide subscriber and, when an OTLP
//! collector is configured, the trace and metric exporters behind it. The
//! returned [`Telemetry`] handle owns those exporters; call
//! [`Telemetry::shutdown`] once the server has stopped so the last batch of
//! spans and the final metric readings leave the process.

use std::str::FromStr;
use std::time::Duration;

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
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when neither `KUBEGATE_LOG` nor `RUST_LOG` is set
pub const DEFAULT_LOG_FILTER: &str =
    "info,kubegate=debug,kubegate_api=debug,kube=info,tower_http=info,hyper=warn,russh=warn";

/// Gateway-specific log filter variable; wins over `RUST_LOG`
pub const LOG_FILTER_ENV: &str = "KUBEGATE_LOG";

/// How often metrics are pushed when the collector doesn't say otherwise
pub const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_secs(30);

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build {signal} exporter for {endpoint}: {message}")]
    Exporter {
        /// "span" or "metric"
        signal: &'static str,
        /// Collector endpoint
        endpoint: String,
        /// Builder message
        message: String,
    },

    /// The log filter did not parse
    #[error("invalid log filter {filter:?}: {message}")]
    Filter {
        /// Filter text
        filter: String,
        /// Parser message
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, with the current span's fields
    #[default]
    Json,
    /// Human-readable output for terminals
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format {:?}", other)),
        }
    }
}

/// What to log and where to export
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` on exported spans and metrics
    pub service_name: String,
    /// Collector endpoint, e.g. `http://otel-collector:4317`; None keeps
    /// everything local
    pub otlp_endpoint: Option<String>,
    /// Metric push interval
    pub metric_interval: Duration,
    /// Log line format
    pub log_format: LogFormat,
    /// Explicit log filter; falls back to the environment, then the default
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .ok()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| "kubegate".to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|endpoint| !endpoint.trim().is_empty()),
            metric_interval: metric_interval(
                std::env::var("OTEL_METRIC_EXPORT_INTERVAL").ok().as_deref(),
            ),
            log_format: LogFormat::default(),
            log_filter: None,
        }
    }
}

/// Push interval from `OTEL_METRIC_EXPORT_INTERVAL` (milliseconds)
fn metric_interval(raw: Option<&str>) -> Duration {
    raw.and_then(|ms| ms.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_METRIC_INTERVAL)
}

/// Filter text by precedence: explicit, `KUBEGATE_LOG`, `RUST_LOG`, default
fn filter_text(explicit: Option<&str>, gateway: Option<&str>, rust_log: Option<&str>) -> String {
    [explicit, gateway, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|filter| !filter.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

/// Installed exporters; dropping this without [`shutdown`](Self::shutdown)
/// may lose the last export batch
#[derive(Default)]
pub struct Telemetry {
    exporters: Option<Exporters>,
}

impl Telemetry {
    /// Whether spans and metrics leave the process
    pub fn exporting(&self) -> bool {
        self.exporters.is_some()
    }

    /// Flush and stop the exporters
    pub fn shutdown(self) {
        let Some(exporters) = self.exporters else {
            return;
        };
        if let Err(e) = exporters.tracer.shutdown() {
            tracing::warn!(error = %e, "span exporter did not shut down cleanly");
        }
        if let Err(e) = exporters.meter.shutdown() {
            tracing::warn!(error = %e, "metric exporter did not shut down cleanly");
        }
    }
}

struct Exporters {
    tracer: TracerProvider,
    meter: SdkMeterProvider,
}

impl Exporters {
    /// Build both OTLP pipelines against one collector and make them global
    fn install(endpoint: &str, resource: Resource, interval: Duration) -> Result<Self, TelemetryError> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", endpoint, e))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", endpoint, e))?;

        let tracer = TracerProvider::builder()
            .with_batch_exporter(spans, runtime::Tokio)
            .with_resource(resource.clone())
            .build();
        let meter = SdkMeterProvider::builder()
            .with_reader(
                PeriodicReader::builder(metrics, runtime::Tokio)
                    .with_interval(interval)
                    .build(),
            )
            .with_resource(resource)
            .build();

        global::set_tracer_provider(tracer.clone());
        global::set_meter_provider(meter.clone());
        Ok(Self { tracer, meter })
    }
}

fn exporter_error(signal: &'static str, endpoint: &str, e: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Exporter {
        signal,
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    }
}

/// Install logging and, when configured, OTLP export
///
/// ```ignore
/// let telemetry = init_telemetry(TelemetryConfig::default())?;
/// // ... serve ...
/// telemetry.shutdown();
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    let filter = filter_text(
        config.log_filter.as_deref(),
        std::env::var(LOG_FILTER_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let env_filter = EnvFilter::try_new(&filter).map_err(|e| TelemetryError::Filter {
        filter: filter.clone(),
        message: e.to_string(),
    })?;

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporters = match &config.otlp_endpoint {
        Some(endpoint) => Some(Exporters::install(
            endpoint,
            gateway_resource(&config.service_name),
            config.metric_interval,
        )?),
        None => None,
    };
    let otel_layer = exporters.as_ref().map(|exporters| {
        tracing_opentelemetry::layer().with_tracer(exporters.tracer.tracer(config.service_name.clone()))
    });

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "exporting spans and metrics over OTLP");
    }
    Ok(Telemetry { exporters })
}

/// Resource attributes identifying this gateway instance
fn gateway_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];

    // POD_NAME via the downward API in-cluster, the host name elsewhere
    if let Some(instance) = ["POD_NAME", "HOSTNAME"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    {
        attributes.push(KeyValue::new("service.instance.id", instance));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }

    Resource::new(attributes)
}
