//! # Ports Layer
//!
//! Transport-facing traits (driven ports). The public API of the bus lives
//! on [`crate::MessageBus`] directly.

pub mod outbound;

pub use outbound::{
    BrokerChannel, BrokerConnection, BrokerTransport, ConfirmFuture, Consumer, EventSink,
    PendingConfirm, QueueOptions, TransportEvent,
};
