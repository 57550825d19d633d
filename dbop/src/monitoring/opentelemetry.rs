//! OpenTelemetry backend for the tracing decorator.
//!
//! [`init_telemetry`] installs OTLP tracer and meter providers once at
//! process startup and hands back a [`TelemetryGuard`]. The guard provides
//! the `tracing-opentelemetry` layer that exports `dbop.operation` and
//! `dbop.attempt` spans, and flushes both providers on shutdown.
//! [`OtelRecorder`] is the [`MetricsRecorder`] that emits the three dbop
//! instruments through an OpenTelemetry meter.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbop::monitoring::{opentelemetry::init_telemetry, TelemetryConfig, Traced};
//! use tracing_subscriber::prelude::*;
//!
//! let config = TelemetryConfig::from_env();
//! let telemetry = init_telemetry(&config)?;
//! tracing_subscriber::registry().with(telemetry.layer()).init();
//!
//! let executor = Traced::new(Executor::new(), &config).with_db_system("postgresql");
//! // ...
//! telemetry.shutdown()?;
//! ```

use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{ExporterBuildError, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

use super::config::{ExporterProtocol, TelemetryConfig};
use super::metrics::{
    MetricsRecorder, ATTEMPTS_TOTAL, OPERATIONS_TOTAL, OPERATION_DURATION_SECONDS,
};
use crate::attempt::{AttemptOutcome, OperationContext, OperationOutcome};

const INSTRUMENTATION_SCOPE: &str = "dbop";

/// Errors raised while installing or flushing the OTLP pipeline.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built.
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(#[from] ExporterBuildError),

    /// A provider failed to flush or shut down.
    #[error("failed to shut down telemetry provider: {0}")]
    Shutdown(String),
}

/// [`MetricsRecorder`] backed by an OpenTelemetry [`Meter`].
#[derive(Debug, Clone)]
pub struct OtelRecorder {
    attempts: Counter<u64>,
    operations: Counter<u64>,
    duration: Histogram<f64>,
}

impl OtelRecorder {
    /// Creates the dbop instruments on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            attempts: meter
                .u64_counter(ATTEMPTS_TOTAL)
                .with_description("Attempts made by dbop executors, by outcome")
                .build(),
            operations: meter
                .u64_counter(OPERATIONS_TOTAL)
                .with_description("Operations run by dbop executors, by outcome")
                .build(),
            duration: meter
                .f64_histogram(OPERATION_DURATION_SECONDS)
                .with_description("Wall-clock duration of dbop operations, backoff included")
                .with_unit("s")
                .build(),
        }
    }

    /// Creates the dbop instruments on the globally installed meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(INSTRUMENTATION_SCOPE))
    }
}

fn operation_attributes(context: &OperationContext, outcome: &'static str) -> [KeyValue; 2] {
    [
        KeyValue::new("dbop.operation", context.display_name().to_string()),
        KeyValue::new("outcome", outcome),
    ]
}

impl MetricsRecorder for OtelRecorder {
    fn record_attempt(&self, context: &OperationContext, outcome: AttemptOutcome) {
        self.attempts
            .add(1, &operation_attributes(context, outcome.as_str()));
    }

    fn record_operation(
        &self,
        context: &OperationContext,
        outcome: OperationOutcome,
        elapsed: Duration,
    ) {
        let attributes = operation_attributes(context, outcome.as_str());
        self.operations.add(1, &attributes);
        self.duration.record(elapsed.as_secs_f64(), &attributes);
    }
}

/// Installed OTLP providers; keep it alive for the life of the process.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether any provider was installed.
    pub const fn is_active(&self) -> bool {
        self.tracer_provider.is_some() || self.meter_provider.is_some()
    }

    /// The `tracing` layer exporting spans, or `None` when telemetry is disabled.
    pub fn layer<S>(&self) -> Option<OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        self.tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(INSTRUMENTATION_SCOPE))
        })
    }

    /// Flushes and shuts down every installed provider.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Shutdown`] if a provider fails to flush.
    pub fn shutdown(self) -> Result<(), TelemetryError> {
        if let Some(provider) = self.tracer_provider {
            provider
                .shutdown()
                .map_err(|error| TelemetryError::Shutdown(error.to_string()))?;
        }
        if let Some(provider) = self.meter_provider {
            provider
                .shutdown()
                .map_err(|error| TelemetryError::Shutdown(error.to_string()))?;
        }
        Ok(())
    }
}

fn resource(config: &TelemetryConfig) -> Resource {
    let builder = Resource::builder().with_service_name(config.service_name.clone());
    match &config.service_version {
        Some(version) => builder
            .with_attribute(KeyValue::new("service.version", version.clone()))
            .build(),
        None => builder.build(),
    }
}

fn span_exporter(config: &TelemetryConfig) -> Result<SpanExporter, ExporterBuildError> {
    match (config.exporter, &config.endpoint) {
        (ExporterProtocol::Grpc, Some(endpoint)) => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build(),
        (ExporterProtocol::Grpc, None) => SpanExporter::builder().with_tonic().build(),
        (ExporterProtocol::Http, Some(endpoint)) => SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint.clone())
            .build(),
        (ExporterProtocol::Http, None) => SpanExporter::builder().with_http().build(),
    }
}

fn metric_exporter(config: &TelemetryConfig) -> Result<MetricExporter, ExporterBuildError> {
    match (config.exporter, &config.endpoint) {
        (ExporterProtocol::Grpc, Some(endpoint)) => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build(),
        (ExporterProtocol::Grpc, None) => MetricExporter::builder().with_tonic().build(),
        (ExporterProtocol::Http, Some(endpoint)) => MetricExporter::builder()
            .with_http()
            .with_endpoint(endpoint.clone())
            .build(),
        (ExporterProtocol::Http, None) => MetricExporter::builder().with_http().build(),
    }
}

/// Installs OTLP tracer and meter providers described by `config`.
///
/// With telemetry disabled nothing is installed and the returned guard is
/// inert. Metrics are installed only when `config.metrics_active()`.
///
/// # Errors
///
/// Returns [`TelemetryError::Exporter`] if an exporter cannot be built.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    if !config.enabled {
        return Ok(TelemetryGuard {
            tracer_provider: None,
            meter_provider: None,
        });
    }

    let resource = resource(config);

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter(config)?)
        .with_resource(resource.clone())
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let meter_provider = if config.metrics_active() {
        let reader = PeriodicReader::builder(metric_exporter(config)?).build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build();
        global::set_meter_provider(provider.clone());
        Some(provider)
    } else {
        None
    };

    tracing::info!(
        service = %config.service_name,
        exporter = ?config.exporter,
        metrics = meter_provider.is_some(),
        "OpenTelemetry export installed"
    );

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
        meter_provider,
    })
}
