use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{Resource, trace as sdktrace};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const OTLP_ENDPOINT_VAR: &str = "CRACK_OTLP_ENDPOINT";

/// Installs the global subscriber: an `RUST_LOG`-filtered fmt layer, plus an
/// OTLP span exporter when `CRACK_OTLP_ENDPOINT` is set.
pub fn init_tracing(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let otel_layer = std::env::var(OTLP_ENDPOINT_VAR)
        .ok()
        .filter(|endpoint| !endpoint.trim().is_empty())
        .and_then(|endpoint| match otlp_tracer(service_name, &endpoint) {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(e) => {
                eprintln!("[{}] OTLP exporter disabled: {}", service_name, e);
                None
            }
        });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if let Err(e) = installed {
        eprintln!("[{}] tracing already initialised: {}", service_name, e);
    }
}

fn otlp_tracer(service_name: &str, endpoint: &str) -> Result<sdktrace::Tracer, String> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| e.to_string())?;
    let resource = Resource::builder_empty()
        .with_attributes(vec![KeyValue::new("service.name", service_name.to_string())])
        .build();
    let provider = sdktrace::SdkTracerProvider::builder()
        .with_simple_exporter(exporter)
        .with_resource(resource)
        .build();
    Ok(provider.tracer(service_name.to_string()))
}
