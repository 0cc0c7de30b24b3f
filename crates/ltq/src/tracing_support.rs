//! OpenTelemetry wiring, optional and additive to the plain `tracing` spans
//! emitted by the worker loop. Disabling this feature still leaves full
//! `tracing` output; enabling it routes that output to an OTLP collector as
//! well.

#![cfg(feature = "tracing-otel")]

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::runtime::Tokio;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Creates the span wrapping a single Message's consumption, tagged for
/// OTel's semantic conventions so trace viewers group it as a consumer span.
pub fn create_task_span(task_name: &str, queue: &str) -> Span {
    tracing::info_span!(
        "task.process",
        otel.name = %task_name,
        otel.kind = "CONSUMER",
        messaging.destination = %queue,
    )
}

/// Initializes global `tracing` + OTLP export. Call once at process startup,
/// before any spans are created. Returns the provider so the caller can hold
/// it for the lifetime of the process and shut it down on exit.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: &str,
) -> anyhow::Result<opentelemetry_sdk::trace::TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_endpoint)
        .build()?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_resource(opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build();

    let tracer = provider.tracer(service_name.to_string());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(provider)
}

/// Flushes and shuts down the exporter. Best-effort: errors are logged, not
/// propagated, since this runs during process teardown.
pub fn shutdown_tracing(provider: opentelemetry_sdk::trace::TracerProvider) {
    if let Err(err) = provider.shutdown() {
        tracing::warn!(error = %err, "error shutting down OTel tracer provider");
    }
}
