//! # Bus Telemetry
//!
//! Observability for the message bus.
//!
//! ## Components
//!
//! - **Logs**: `tracing` subscriber with env filter, pretty or JSON output
//! - **Traces**: optional OTLP export, plus W3C trace-context propagation
//!   through message headers
//! - **Metrics**: Prometheus counters and gauges for publish, delivery and
//!   connection lifecycle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{TelemetryConfig, init_telemetry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let _guard = init_telemetry(config).await.expect("Failed to init telemetry");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset | OTLP endpoint, export disabled when unset |
//! | `OTEL_SERVICE_NAME` | `messagebus` | Service name in traces |
//! | `BUS_LOG_LEVEL` | `info` | Log level filter |
//! | `BUS_JSON_LOGS` | `false` (`true` in containers) | JSON log lines |

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

mod config;
mod context;
pub mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use context::{HeaderCarrier, TraceContext};
pub use metrics::{register_metrics, MetricsHandle};
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize OpenTelemetry tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging, trace export and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
/// When dropped, it flushes pending spans.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics_handle = register_metrics()?;
    let tracing_guard = tracing_setup::init_tracing(&config).await?;

    Ok(TelemetryGuard {
        _tracing: tracing_guard,
        _metrics: metrics_handle,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
