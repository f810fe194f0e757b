//! Tracing subscriber set-up
//!
//! Logs go to stdout through `tracing-subscriber`, as text or JSON. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans are also exported over OTLP
//! (tonic) with a batch processor on the tokio runtime.

use clap::ValueEnum;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn otlp_tracer(service_name: &str, endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("Failed to install OTLP pipeline: {}", e)))
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init(service_name: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (json_layer, text_layer) = match format {
        LogFormat::Json => (Some(fmt::layer().json().with_current_span(true)), None),
        LogFormat::Text => (None, Some(fmt::layer().with_target(true))),
    };

    let otel_layer = match std::env::var(OTLP_ENDPOINT_ENV) {
        Ok(endpoint) if !endpoint.is_empty() => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let tracer = otlp_tracer(service_name, &endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        _ => None,
    };
    let otel_enabled = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("Failed to install subscriber: {}", e)))?;

    if otel_enabled {
        tracing::info!("OpenTelemetry tracing initialized");
    } else {
        tracing::info!("OpenTelemetry tracing disabled ({} not set)", OTLP_ENDPOINT_ENV);
    }
    Ok(())
}

/// Flush buffered spans
pub fn shutdown() {
    global::shutdown_tracer_provider();
}
