//! # Message Bus
//!
//! Resilient, topic-routed publish/subscribe over an AMQP-compatible broker.
//!
//! ## Purpose
//!
//! Keeps one logical connection and channel to the broker, survives broker
//! restarts, network partitions and channel errors, and re-establishes every
//! registered listener after each reconnect.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect()──→ Connecting ──→ Ready
//!                                  ↑            │ connection/channel error
//!                                  │            ↓
//!                                  └──timer── Reconnecting
//!
//! shutdown() from any state ──→ Closed (terminal)
//! ```
//!
//! ## Guarantees
//!
//! | Property | Enforcement |
//! |----------|-------------|
//! | One connection, one channel | `service/lifecycle.rs` session slot |
//! | Concurrent `connect()` calls share one attempt | `service/lifecycle.rs` shared attempt |
//! | At most one reconnect timer | `service/reconnect.rs` timer slot |
//! | Listeners survive reconnects | `service/listener.rs` registry, re-bound before `Ready` |
//! | Ack before callback, callback isolation | `service/listener.rs` pump + dispatcher |
//! | Backoff monotonic, capped at 10 s | `domain/backoff.rs` |
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  adapters/ - InMemoryBroker, AmqpTransport (feature "amqp")     │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ implements ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ports/outbound.rs - BrokerTransport, BrokerConnection,         │
//! │                      BrokerChannel, TransportEvent              │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ uses ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  service/ - MessageBus: lifecycle, publisher, listeners,        │
//! │             reconnect scheduler                                 │
//! │  domain/  - topics, errors, states, backoff, messages           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use messagebus::{BusConfig, MessageBus, PublishOptions};
//! use messagebus::topic::{listen_topic, publish_topic, WORKSPACE_EXCHANGE};
//!
//! let (bus, _broker) = MessageBus::in_memory(BusConfig::default());
//! bus.connect().await?;
//! bus.publish(WORKSPACE_EXCHANGE, &publish_topic("u1", "ws1", "updates"), &payload, PublishOptions::default())
//!     .await?;
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

pub use domain::topic;

pub use adapters::{ConfirmBehavior, InMemoryBroker};
#[cfg(feature = "amqp")]
pub use adapters::AmqpTransport;
pub use config::{BusConfig, ClientIdentity, ConfigError, ConnectOptions, ReconnectPolicy, TlsConfig};
pub use domain::{
    BusError, ConnectionState, Delivery, DeliveryContext, PublishOptions, Topic, TransportError,
};
pub use service::{ListenerHandle, ListenerId, MessageBus};

// Re-exported for listener callbacks and external cancellation.
pub use bus_telemetry::TraceContext;
pub use tokio_util::sync::CancellationToken;
