//! Trace context propagation through message headers.
//!
//! When a message crosses a process boundary via the broker, the trace
//! context travels in the message headers so the consumer's spans join the
//! publisher's trace.
//!
//! ## How It Works
//!
//! 1. The publisher captures the active context as a `TraceContext`
//! 2. `inject` writes it into the outgoing header map (`traceparent`/`tracestate`)
//! 3. The consumer calls `TraceContext::extract` on the delivery headers
//! 4. `delivery_span` opens a span parented to the remote context
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut headers = HeaderCarrier::new();
//! TraceContext::extract_current().inject(&mut headers);
//!
//! // ...on the receiving side
//! let ctx = TraceContext::extract(&headers);
//! let span = ctx.delivery_span("ws.events", "u1.ws1.updates");
//! let _guard = span.enter();
//! ```

use std::collections::HashMap;

use opentelemetry::{
    propagation::TextMapPropagator,
    trace::{SpanContext, TraceContextExt},
    Context,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Key/value carrier used for message headers.
pub type HeaderCarrier = HashMap<String, String>;

/// A (possibly empty) remote trace context.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    span_context: Option<SpanContext>,
}

impl TraceContext {
    /// Create a new empty trace context.
    pub fn new() -> Self {
        Self { span_context: None }
    }

    /// Wrap an existing span context. Invalid contexts yield an empty `TraceContext`.
    pub fn from_span_context(span_context: SpanContext) -> Self {
        Self {
            span_context: span_context.is_valid().then_some(span_context),
        }
    }

    /// Extract the trace context of the current `tracing` span.
    ///
    /// Empty unless an OpenTelemetry layer is installed and a span is active.
    pub fn extract_current() -> Self {
        let context = tracing::Span::current().context();
        Self::from_span_context(context.span().span_context().clone())
    }

    /// Read a trace context from message headers.
    pub fn extract(headers: &HeaderCarrier) -> Self {
        let context = TraceContextPropagator::new().extract(headers);
        Self::from_span_context(context.span().span_context().clone())
    }

    /// Write this context into message headers. Empty contexts write nothing.
    pub fn inject(&self, headers: &mut HeaderCarrier) {
        if let Some(span_context) = &self.span_context {
            let context = Context::new().with_remote_span_context(span_context.clone());
            TraceContextPropagator::new().inject_context(&context, headers);
        }
    }

    /// Check if this context has a valid trace.
    pub fn is_valid(&self) -> bool {
        self.span_context.is_some()
    }

    /// Hex trace id, if any.
    pub fn trace_id(&self) -> Option<String> {
        self.span_context
            .as_ref()
            .map(|ctx| ctx.trace_id().to_string())
    }

    /// Hex span id of the remote parent, if any.
    pub fn span_id(&self) -> Option<String> {
        self.span_context
            .as_ref()
            .map(|ctx| ctx.span_id().to_string())
    }

    /// Open the span a delivered message is handled in.
    ///
    /// The span is parented to this remote context when one is present.
    pub fn delivery_span(&self, exchange: &str, routing_key: &str) -> tracing::Span {
        let span = tracing::info_span!(
            "messagebus.deliver",
            exchange = %exchange,
            routing_key = %routing_key,
            trace_id = tracing::field::Empty,
        );
        if let Some(ctx) = &self.span_context {
            span.record("trace_id", tracing::field::display(ctx.trace_id()));
            span.set_parent(Context::new().with_remote_span_context(ctx.clone()));
        }
        span
    }
}
