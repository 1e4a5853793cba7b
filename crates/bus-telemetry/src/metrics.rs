//! Prometheus metrics for the message bus.
//!
//! All metrics follow the naming convention: `bus_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., messages_received_total)
//! - **Gauge**: Value that can go up or down (e.g., listeners_bound)
//! - **Histogram**: Distribution of values (e.g., publish_confirm_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
pub use prometheus::Gauge;
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH GATEWAY
    // =========================================================================

    /// Messages handed to the broker
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("bus_messages_published_total", "Messages published to the broker"),
        &["mode", "outcome"]  // mode: fire_and_forget/confirm, outcome: ok/nacked/failed
    ).expect("metric creation failed");

    /// Time between publish and broker confirmation
    pub static ref PUBLISH_CONFIRM_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bus_publish_confirm_duration_seconds",
            "Time spent waiting for broker publisher confirms"
        ).buckets(exponential_buckets(0.0005, 2.0, 14).expect("valid bucket layout"))
    ).expect("metric creation failed");

    // =========================================================================
    // LISTENERS
    // =========================================================================

    /// Messages received on any bound listener
    pub static ref MESSAGES_RECEIVED: Counter = Counter::new(
        "bus_messages_received_total",
        "Messages received from the broker"
    ).expect("metric creation failed");

    /// Messages dropped because the payload could not be decoded
    pub static ref MALFORMED_MESSAGES: Counter = Counter::new(
        "bus_malformed_messages_total",
        "Messages dropped because their payload failed to parse"
    ).expect("metric creation failed");

    /// Listener callbacks that returned an error or panicked
    pub static ref LISTENER_FAILURES: Counter = Counter::new(
        "bus_listener_failures_total",
        "Listener callbacks that failed"
    ).expect("metric creation failed");

    /// Listeners currently bound to a live channel, summed over every bus
    /// in the process
    pub static ref LISTENERS_BOUND: Gauge = Gauge::new(
        "bus_listeners_bound",
        "Listeners currently bound to a live channel"
    ).expect("metric creation failed");

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Connection attempts by outcome
    pub static ref CONNECT_ATTEMPTS: CounterVec = CounterVec::new(
        Opts::new("bus_connect_attempts_total", "Broker connection attempts"),
        &["outcome"]  // outcome: success/failed
    ).expect("metric creation failed");

    /// Reconnects scheduled after transport failures
    pub static ref RECONNECTS_SCHEDULED: Counter = Counter::new(
        "bus_reconnects_scheduled_total",
        "Reconnect timers scheduled after a transport failure"
    ).expect("metric creation failed");

    /// Buses in the process holding a live session
    pub static ref CONNECTION_READY: Gauge = Gauge::new(
        "bus_connection_ready",
        "Bus instances with a live connection and channel"
    ).expect("metric creation failed");
}

/// Handle to the metrics registry.
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all bus metrics with the global registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Publish gateway
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(PUBLISH_CONFIRM_DURATION.clone()),
        // Listeners
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(MALFORMED_MESSAGES.clone()),
        Box::new(LISTENER_FAILURES.clone()),
        Box::new(LISTENERS_BOUND.clone()),
        // Lifecycle
        Box::new(CONNECT_ATTEMPTS.clone()),
        Box::new(RECONNECTS_SCHEDULED.clone()),
        Box::new(CONNECTION_READY.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
