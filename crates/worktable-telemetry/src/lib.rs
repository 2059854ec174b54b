//! OpenTelemetry integration for worktable.
//!
//! Provides OTel tracing layer setup, W3C Trace Context propagation across
//! the HTTP boundary (mutation client to server handlers), and a sampler with
//! differentiated rates by span category.
//!
//! # Activation
//!
//! Built with the `telemetry` feature, OTel export activates when standard
//! OTel environment variables are set:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 cargo run -p worktable-server
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint
//! is set. Without the feature every function here is a cheap no-op.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

/// HTTP header carrying the W3C `traceparent`.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// HTTP header carrying the W3C `tracestate`.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Check whether OTel export should be enabled.
///
/// Returns `true` when standard OTel env vars indicate export is desired:
/// - `OTEL_SDK_DISABLED` is NOT set to `"true"`
/// - AND at least one of:
///   - `OTEL_EXPORTER_OTLP_ENDPOINT` is set
///   - `OTEL_TRACES_EXPORTER` is set (and not `"none"`)
pub fn otel_enabled() -> bool {
    if std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        return true;
    }

    if let Ok(exporter) = std::env::var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Inject W3C Trace Context from the current tracing span.
///
/// Returns `(traceparent, tracestate)`; both empty when there is nothing to
/// propagate.
pub fn inject_trace_context() -> (String, String) {
    #[cfg(feature = "telemetry")]
    {
        otel::inject_trace_context_impl()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        (String::new(), String::new())
    }
}

/// Extract W3C Trace Context and create an `http.request` span linked to the
/// remote parent.
pub fn extract_trace_context(traceparent: &str, tracestate: &str) -> tracing::Span {
    #[cfg(feature = "telemetry")]
    {
        otel::extract_trace_context_impl(traceparent, tracestate)
    }
    #[cfg(not(feature = "telemetry"))]
    {
        let _ = (traceparent, tracestate);
        tracing::info_span!("http.request")
    }
}

/// Sampling rate for a span name, by category prefix.
///
/// | Prefix        | Rate | Rationale                              |
/// |---------------|------|----------------------------------------|
/// | `mutation.*`  | 100% | Every write matters for debugging      |
/// | `registry.*`  | 100% | Watch lifecycle (acquire/release)      |
/// | `watch.*`     | 10%  | One span per push, high volume         |
/// | `http.*`      | 10%  | Request handling                       |
/// | other         | 10%  | Default for unclassified spans         |
///
/// Errors are always sampled regardless of category.
pub fn category_rate(name: &str) -> f64 {
    if name.starts_with("mutation") || name.starts_with("registry") {
        1.0
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_rates() {
        assert_eq!(category_rate("mutation.submit"), 1.0);
        assert_eq!(category_rate("registry.acquire"), 1.0);
        assert_eq!(category_rate("watch.pump"), 0.1);
        assert_eq!(category_rate("http.request"), 0.1);
        assert_eq!(category_rate("something"), 0.1);
    }

    #[test]
    fn test_inject_outside_any_trace_is_empty() {
        let (traceparent, tracestate) = inject_trace_context();
        assert!(traceparent.is_empty());
        assert!(tracestate.is_empty());
    }

    #[test]
    fn test_extract_without_parent_still_yields_span() {
        // No subscriber installed, so the span is disabled, but the call must
        // not panic on empty or garbage input.
        let _ = extract_trace_context("", "");
        let _ = extract_trace_context("not-a-traceparent", "");
    }
}
