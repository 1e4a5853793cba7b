//! # Bus Probe
//!
//! Listens on the workspace exchange and logs every event it sees.
//!
//! ```bash
//! MESSAGEBUS_HOST=rabbitmq MESSAGEBUS_CA="$(cat ca.pem)" \
//!     MESSAGEBUS_PKCS12=client.p12 MESSAGEBUS_PKCS12_PASSWORD=changeit \
//!     bus-probe '*.ws-1.#'
//! ```
//!
//! The selector defaults to everything (`*.*.#`). Set `BUS_PROBE_PUBLISH` to
//! a JSON document to publish it once under `BUS_PROBE_TOPIC` after connecting.
//! The bus metrics are dumped at debug level on exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use bus_telemetry::{init_telemetry, metrics::encode_metrics, TelemetryConfig};
use messagebus::topic::{listen_topic, parse_owner};
use messagebus::{AmqpTransport, BusConfig, MessageBus, PublishOptions};
use tracing::{debug, info, warn};

fn selector_from_args() -> String {
    std::env::args()
        .nth(1)
        .unwrap_or_else(|| listen_topic(None, None, None))
}

async fn publish_once(bus: &MessageBus) -> Result<()> {
    let Ok(document) = std::env::var("BUS_PROBE_PUBLISH") else {
        return Ok(());
    };
    let topic = std::env::var("BUS_PROBE_TOPIC").context("BUS_PROBE_TOPIC is required with BUS_PROBE_PUBLISH")?;
    let payload: serde_json::Value =
        serde_json::from_str(&document).context("BUS_PROBE_PUBLISH is not valid JSON")?;

    bus.publish(&bus.config().exchange, &topic, &payload, PublishOptions::confirmed())
        .await
        .with_context(|| format!("publish to {topic}"))?;
    info!(topic = %topic, "Published probe event");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::from_env())
        .await
        .context("initialize telemetry")?;

    let config = BusConfig::from_env();
    config.validate().context("invalid message bus configuration")?;
    info!(url = %config.redacted_url(), exchange = %config.exchange, "Starting bus probe");

    let transport = Arc::new(AmqpTransport::new(&config).context("load TLS client identity")?);
    let bus = MessageBus::new(config, transport);

    let selector = selector_from_args();
    let _listener = bus
        .register_listener(&selector, |ctx, event: serde_json::Value| async move {
            info!(
                routing_key = %ctx.routing_key,
                owner = ?parse_owner(Some(&ctx.routing_key)),
                trace_id = ?ctx.trace.trace_id(),
                event = %event,
                "Event"
            );
            anyhow::Ok(())
        })
        .await;

    bus.connect().await.context("connect to message bus")?;
    if let Err(e) = publish_once(&bus).await {
        warn!(error = %e, "Probe publish failed");
    }

    info!(selector = %selector, "Listening. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    bus.shutdown().await;
    match encode_metrics() {
        Ok(dump) => debug!(metrics = %dump, "Final bus metrics"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
    Ok(())
}
