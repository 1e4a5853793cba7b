//! # Driven Ports (Outbound SPI)
//!
//! The broker surface the bus requires. Adapters implement these traits for a
//! concrete transport; [`crate::adapters::InMemoryBroker`] implements them in
//! process for tests and local runs.
//!
//! ## Ownership
//!
//! ```text
//! BrokerTransport --connect--> BrokerConnection --open_channel--> BrokerChannel
//!                                     |                                |
//!                                     +------ TransportEvent sink -----+
//! ```
//!
//! A channel never outlives its connection. Asynchronous failures of either
//! are reported on the event sink passed to [`BrokerTransport::connect`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::domain::{Confirmation, Delivery, OutboundMessage, TransportError};

/// Asynchronous failure reported by a live connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection failed.
    ConnectionError(String),
    /// The connection was closed by the broker or the network.
    ConnectionClosed,
    /// The channel failed. The connection may still be open.
    ChannelError(String),
}

/// Sink for [`TransportEvent`]s of one connection.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Resolves once the broker acknowledges or rejects a published message.
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, TransportError>>;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Exclusive, auto-deleting, non-durable. Used for listener queues.
    pub const fn anonymous() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Durable, shared, kept when unused.
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// An active consumer on a queue.
pub struct Consumer {
    pub tag: String,
    /// Ends when the consumer is cancelled or its channel closes.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Outcome of handing a message to the channel.
pub struct PendingConfirm {
    /// The transport accepted the message into its write buffer.
    pub accepted: bool,
    /// Broker acknowledgement. Dropping it is fine for fire-and-forget.
    pub confirmation: ConfirmFuture,
}

/// Factory for broker connections.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a connection. Failures of the live connection and of its
    /// channels are reported on `events`.
    ///
    /// The caller bounds this with its own per-attempt timeout.
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn BrokerConnection>, TransportError>;

    /// Log-safe description of the target (no credentials).
    fn describe(&self) -> String;
}

/// A live connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel with publisher confirms enabled.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a topic exchange.
    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), TransportError>;

    /// Declare a queue. An empty `name` asks the broker to generate one.
    /// Returns the queue name.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Start consuming with explicit acknowledgement.
    async fn consume(&self, queue: &str) -> Result<Consumer, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Cancel a consumer. Its delivery stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Delete a queue. Deleting a missing queue succeeds.
    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError>;

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
