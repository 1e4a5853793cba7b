//! # Adapters Layer
//!
//! Transport implementations of the broker ports.

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::{BindingInfo, ConfirmBehavior, InMemoryBroker};

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
