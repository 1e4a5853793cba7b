//! Error taxonomy for the message bus.
//!
//! Only caller-initiated operations surface errors. Failures inside the
//! consume loop or the reconnect scheduler are logged and recovered locally.

use thiserror::Error;

/// Errors surfaced to callers of the bus.
///
/// `Clone` so one shared connect attempt can hand the same outcome to every
/// joined caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// No ready channel. Never retried.
    #[error("Not connected")]
    NotConnected,

    /// Transient transport failure during a single connect attempt.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The bounded connect retry loop was exhausted.
    #[error("Unable to connect ({attempts} attempts): {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    /// The broker negatively acknowledged a confirm-mode publish.
    #[error("Publish rejected by broker: {reason}")]
    PublishNacked { reason: String },

    /// A delivered payload failed to decode. Logged by the dispatcher, never
    /// returned from a public operation.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The outgoing payload could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The bus was shut down.
    #[error("Message bus is shut down")]
    ShutDown,

    /// Broker-side failure of a caller operation on a ready channel.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl BusError {
    /// True for failures a later `connect()` may resolve.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Connection(_) | Self::ConnectFailed { .. } | Self::Transport(_)
        )
    }
}

/// Errors reported by transport adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The per-attempt connect timeout elapsed.
    #[error("connect timed out after {0} ms")]
    Timeout(u64),

    /// The channel or its connection is already closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Any other broker-reported failure.
    #[error("broker error: {0}")]
    Broker(String),
}

impl TransportError {
    /// Cleanup against a closed channel is a normal outcome.
    #[must_use]
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}
