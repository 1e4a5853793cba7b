//! Connection lifecycle states.
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Reconnecting -> Connecting -> Ready ...
//!                                  \
//!                                   shutdown() -> Closed (terminal)
//! ```
//!
//! Published on a `watch` channel so callers can react to transitions
//! instead of polling `is_connected()`.

use std::fmt;
use std::time::Duration;

/// Current state of the logical broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight.
    Disconnected,

    /// A connect attempt (or retry loop) is running.
    Connecting,

    /// A channel is bound and every registered listener has been re-bound.
    Ready,

    /// The connection was lost. A reconnect is scheduled after `delay`.
    Reconnecting { delay: Duration },

    /// Explicitly shut down. No further connects or reconnects.
    Closed,
}

impl ConnectionState {
    /// Short identifier, for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Ready => "Ready",
            ConnectionState::Reconnecting { .. } => "Reconnecting",
            ConnectionState::Closed => "Closed",
        }
    }

    /// True only in `Ready`.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// True while a connect attempt is running or scheduled.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    /// True after shutdown.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting { delay } => {
                write!(f, "{} (in {} ms)", self.as_str(), delay.as_millis())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}
