//! # Domain Layer
//!
//! Pure types and functions. No I/O, no async runtime.

pub mod backoff;
pub mod errors;
pub mod message;
pub mod state;
pub mod topic;

pub use backoff::Backoff;
pub use errors::{BusError, TransportError};
pub use message::{
    Confirmation, Delivery, DeliveryContext, OutboundMessage, PublishOptions, DEFAULT_EXCHANGE,
};
pub use state::ConnectionState;
pub use topic::{
    listen_topic, parse_owner, parse_topic, publish_topic, Topic, TopicSelector,
    WorkspaceSubtopic, PREBUILD_UPDATABLE_QUEUE, WORKSPACE_EXCHANGE, WORKSPACE_LOCAL_EXCHANGE,
};
