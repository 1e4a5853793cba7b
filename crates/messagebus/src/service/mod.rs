//! # Service Layer
//!
//! [`MessageBus`] ties the lifecycle manager, listener registry, publish
//! gateway and reconnect scheduler together.

mod lifecycle;
mod listener;
mod publisher;
mod reconnect;

pub use listener::{ListenerHandle, ListenerId};

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapters::InMemoryBroker;
use crate::config::{BusConfig, ConnectOptions};
use crate::domain::{BusError, ConnectionState, DeliveryContext};
use crate::ports::{BrokerTransport, QueueOptions};
use lifecycle::BusInner;

/// Resilient topic-routed message bus client.
///
/// Cheap to clone; clones share one connection, listener registry and
/// reconnect state. Independent instances share nothing.
///
/// ```rust,ignore
/// let config = BusConfig::from_env();
/// let bus = MessageBus::new(config.clone(), Arc::new(AmqpTransport::new(&config)?));
/// bus.connect().await?;
///
/// let handle = bus
///     .register_listener(&listen_topic(None, Some("ws-1"), None), |ctx, update: InstanceUpdate| async move {
///         tracing::info!(topic = %ctx.routing_key, phase = %update.phase, "update");
///         Ok(())
///     })
///     .await;
///
/// bus.publish(WORKSPACE_EXCHANGE, &publish_topic("u1", "ws-1", "updates"), &update, PublishOptions::confirmed())
///     .await?;
/// handle.cancel().await;
/// ```
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            inner: Arc::new(BusInner::new(config, transport)),
        }
    }

    /// A bus over a fresh [`InMemoryBroker`], returned alongside it.
    pub fn in_memory(config: BusConfig) -> (Self, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        let bus = Self::new(config, Arc::new(broker.clone()));
        (bus, broker)
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Connect with the configured retry options.
    pub async fn connect(&self) -> Result<(), BusError> {
        self.inner.connect(self.inner.config.connect).await
    }

    /// Connect with explicit retry options.
    ///
    /// Joins an in-flight attempt if there is one; the options of the running
    /// attempt apply. Returns immediately when already connected.
    pub async fn connect_with(&self, options: ConnectOptions) -> Result<(), BusError> {
        self.inner.connect(options).await
    }

    /// True iff a channel is currently bound.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.subscribe_state()
    }

    /// Reconnects scheduled so far.
    pub fn reconnects_scheduled(&self) -> u64 {
        self.inner.reconnect.lock().scheduled()
    }

    /// Number of registered listeners, bound or not.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Register a listener for `selector` on the configured exchange.
    ///
    /// The listener is kept across reconnects until cancelled. It is bound
    /// right away when connected, otherwise on the next successful connect.
    /// Payloads that fail to decode into `T` are logged and dropped.
    pub async fn register_listener<T, F, Fut>(&self, selector: &str, callback: F) -> ListenerHandle
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(DeliveryContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = self.inner.listeners.insert(selector, callback);

        if let Some((epoch, channel)) = self.inner.current_channel() {
            if let Err(e) = self
                .inner
                .listeners
                .bind(handle.id(), epoch, &channel, &self.inner.config.exchange)
                .await
            {
                warn!(listener = %handle.id(), error = %e, "Failed to bind listener, will retry on reconnect");
            }
        }
        handle
    }

    /// Register a listener disposed when `token` is cancelled.
    ///
    /// Returns `None` without registering anything if `token` is already
    /// cancelled.
    pub async fn register_listener_with_token<T, F, Fut>(
        &self,
        selector: &str,
        callback: F,
        token: CancellationToken,
    ) -> Option<ListenerHandle>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(DeliveryContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if token.is_cancelled() {
            return None;
        }
        let handle = self.register_listener(selector, callback).await;

        let lifetime = handle.lifetime();
        let registry = Arc::clone(&self.inner.listeners);
        let id = handle.id();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => registry.cancel(id).await,
                _ = lifetime.cancelled() => {}
            }
        });
        Some(handle)
    }

    /// Declare a durable named queue on the ready channel.
    pub async fn assert_durable_queue(&self, name: &str) -> Result<(), BusError> {
        let channel = self.inner.ready_channel()?;
        channel.declare_queue(name, QueueOptions::durable()).await?;
        Ok(())
    }

    /// Close channel and connection and stop reconnecting. Terminal.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}
