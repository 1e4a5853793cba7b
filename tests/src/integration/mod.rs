//! Cross-module flows of the message bus.

#[cfg(test)]
mod fixtures;

pub mod listeners;
pub mod publish;
pub mod reconnect;
