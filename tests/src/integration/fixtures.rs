//! Shared fixtures for integration flows.

use std::time::Duration;

use futures::future::{ready, Ready};
use messagebus::{BusConfig, ConnectOptions, DeliveryContext, InMemoryBroker, MessageBus, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Payload shape of a workspace instance update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    pub instance_id: String,
    pub phase: String,
}

impl InstanceUpdate {
    pub fn new(instance_id: &str, phase: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            phase: phase.to_string(),
        }
    }
}

/// Short retry and reconnect delays so flows finish quickly.
pub fn fast_config() -> BusConfig {
    BusConfig {
        connect: ConnectOptions {
            retries: 3,
            retry_delay: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(500),
        },
        reconnect: ReconnectPolicy::starting_at(Duration::from_millis(20)),
        ..BusConfig::default()
    }
}

/// A bus over a fresh in-memory broker, already connected.
pub async fn connected_bus(config: BusConfig) -> (MessageBus, InMemoryBroker) {
    let (bus, broker) = MessageBus::in_memory(config);
    bus.connect().await.expect("in-memory connect");
    (bus, broker)
}

/// A listener callback forwarding every delivery to the returned receiver.
#[allow(clippy::type_complexity)]
pub fn recorder<T: Send + 'static>() -> (
    mpsc::UnboundedReceiver<(DeliveryContext, T)>,
    impl Fn(DeliveryContext, T) -> Ready<anyhow::Result<()>> + Send + Sync + 'static,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |ctx: DeliveryContext, payload: T| {
        let _ = tx.send((ctx, payload));
        ready(Ok(()))
    };
    (rx, callback)
}

/// Next recorded delivery, failing the test after one second.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<(DeliveryContext, T)>) -> (DeliveryContext, T) {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("recorder dropped")
}

/// Assert nothing more arrives within a short window.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<(DeliveryContext, T)>) {
    if let Ok(Some((ctx, payload))) = timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected delivery on {}: {payload:?}", ctx.routing_key);
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
