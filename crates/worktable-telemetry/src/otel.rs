//! OTel internals: tracing layer, W3C propagation, and sampling.

use std::collections::HashMap;

use opentelemetry::trace::{Link, SamplingResult, SpanKind, TraceId, TracerProvider as _};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::{ExporterBuildError, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::{TRACEPARENT_HEADER, TRACESTATE_HEADER, category_rate};

/// Shuts down the tracer provider on drop, flushing pending spans.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build an OpenTelemetry tracing layer and guard.
///
/// Must be called from inside a Tokio runtime (the batch exporter spawns onto
/// it). The guard must outlive the application so spans are flushed.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, opentelemetry_sdk::trace::SdkTracer>, OtelGuard), ExporterBuildError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(worktable_sampler())
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();

    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer("worktable");
    let layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok((layer, OtelGuard { provider }))
}

// ============================================================================
// W3C Trace Context propagation
// ============================================================================

pub(crate) fn inject_trace_context_impl() -> (String, String) {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = tracing::Span::current().context();
    let propagator = TraceContextPropagator::new();

    let mut carrier = HashMap::new();
    propagator.inject_context(&cx, &mut carrier);

    let traceparent = carrier.remove(TRACEPARENT_HEADER).unwrap_or_default();
    let tracestate = carrier.remove(TRACESTATE_HEADER).unwrap_or_default();
    (traceparent, tracestate)
}

pub(crate) fn extract_trace_context_impl(traceparent: &str, tracestate: &str) -> tracing::Span {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let span = tracing::info_span!("http.request");
    if traceparent.is_empty() {
        return span;
    }

    let mut carrier = HashMap::new();
    carrier.insert(TRACEPARENT_HEADER.to_string(), traceparent.to_string());
    if !tracestate.is_empty() {
        carrier.insert(TRACESTATE_HEADER.to_string(), tracestate.to_string());
    }

    let cx = TraceContextPropagator::new().extract(&carrier);
    span.set_parent(cx);
    span
}

// ============================================================================
// Sampling
// ============================================================================

/// Root sampler: follows the parent's decision when there is one (so a trace
/// that crossed the HTTP hop stays whole), otherwise [`CategorySampler`].
fn worktable_sampler() -> Sampler {
    Sampler::ParentBased(Box::new(CategorySampler))
}

/// Keeps error spans, then samples by span-name category (see
/// [`category_rate`]).
#[derive(Debug, Clone)]
struct CategorySampler;

fn marks_error(attributes: &[KeyValue]) -> bool {
    attributes.iter().any(|kv| match kv.key.as_str() {
        "otel.status_code" => kv.value.as_str() == "ERROR",
        "error" => kv.value.as_str() == "true",
        _ => false,
    })
}

impl ShouldSample for CategorySampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let rate = if marks_error(attributes) { 1.0 } else { category_rate(name) };
        Sampler::TraceIdRatioBased(rate).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}
