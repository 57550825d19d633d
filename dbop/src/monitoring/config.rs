//! Telemetry configuration.
//!
//! Observability is configured once, at process startup, and handed to the
//! [`Traced`](super::Traced) decorator. The engine itself never reads the
//! environment.

use std::env;

use serde::{Deserialize, Serialize};

/// Enables tracing and metrics.
pub const ENV_ENABLED: &str = "DBOP_OTEL_ENABLED";
/// Enables metrics when tracing is enabled (on by default).
pub const ENV_METRICS_ENABLED: &str = "DBOP_OTEL_METRICS_ENABLED";
/// Service version reported in the telemetry resource.
pub const ENV_SERVICE_VERSION: &str = "DBOP_SERVICE_VERSION";
/// Service name reported in the telemetry resource.
pub const ENV_SERVICE_NAME: &str = "DBOP_OTEL_SERVICE_NAME";
/// OTLP transport, `grpc` or `http`.
pub const ENV_EXPORTER: &str = "DBOP_OTEL_EXPORTER";
/// Standard OTLP collector endpoint.
pub const ENV_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// OTLP transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExporterProtocol {
    /// OTLP over gRPC.
    #[default]
    Grpc,
    /// OTLP over HTTP with protobuf payloads.
    Http,
}

impl ExporterProtocol {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "grpc" => Some(Self::Grpc),
            "http" | "http/protobuf" => Some(Self::Http),
            _ => None,
        }
    }
}

/// Switches and exporter settings for the observability layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit spans (and, if `metrics_enabled`, metrics). Off means pass-through.
    pub enabled: bool,
    /// Emit metrics alongside spans.
    pub metrics_enabled: bool,
    /// `service.name` resource attribute.
    pub service_name: String,
    /// `service.version` resource attribute.
    pub service_version: Option<String>,
    /// OTLP transport.
    pub exporter: ExporterProtocol,
    /// Collector endpoint; the exporter default is used when absent.
    pub endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metrics_enabled: true,
            service_name: "dbop".to_string(),
            service_version: None,
            exporter: ExporterProtocol::default(),
            endpoint: None,
        }
    }
}

impl TelemetryConfig {
    /// A configuration with spans and metrics switched on.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Sets the service name.
    #[must_use]
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Turns metrics on or off.
    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Reads the configuration from the process environment.
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|value| parse_flag(&value))
                .unwrap_or(default)
        };

        Self {
            enabled: flag(ENV_ENABLED, defaults.enabled),
            metrics_enabled: flag(ENV_METRICS_ENABLED, defaults.metrics_enabled),
            service_name: lookup(ENV_SERVICE_NAME)
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.service_name),
            service_version: lookup(ENV_SERVICE_VERSION).filter(|v| !v.trim().is_empty()),
            exporter: lookup(ENV_EXPORTER)
                .and_then(|v| ExporterProtocol::parse(&v))
                .unwrap_or(defaults.exporter),
            endpoint: lookup(ENV_ENDPOINT).filter(|v| !v.trim().is_empty()),
        }
    }

    /// Whether metrics should actually be recorded.
    pub const fn metrics_active(&self) -> bool {
        self.enabled && self.metrics_enabled
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
