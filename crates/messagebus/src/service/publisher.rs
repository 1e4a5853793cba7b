//! # Publish Gateway
//!
//! Serialize, attach trace headers, hand to the ready channel. Confirm mode
//! additionally waits for the broker's ack.

use std::sync::Arc;

use bus_telemetry::metrics::{HistogramTimer, MESSAGES_PUBLISHED, PUBLISH_CONFIRM_DURATION};
use serde::Serialize;
use tracing::debug;

use super::MessageBus;
use crate::domain::{BusError, OutboundMessage, PublishOptions, DEFAULT_EXCHANGE};
use crate::ports::BrokerChannel;

impl MessageBus {
    /// Publish `payload` as JSON to `exchange` under routing key `topic`.
    ///
    /// Fails immediately with [`BusError::NotConnected`] when no channel is
    /// ready; nothing is queued. Without `confirm` the result is whether the
    /// transport accepted the message into its buffer. With `confirm` it
    /// resolves once the broker acks, or fails with
    /// [`BusError::PublishNacked`].
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        topic: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<bool, BusError> {
        let channel = self.inner.ready_channel()?;
        let message = OutboundMessage::json(exchange, topic, payload, options.trace.as_ref())?;
        send(channel, message, options.confirm).await
    }

    /// Publish `payload` directly to an existing named queue.
    pub async fn publish_to_queue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<bool, BusError> {
        let channel = self.inner.ready_channel()?;
        let message =
            OutboundMessage::json(DEFAULT_EXCHANGE, queue, payload, options.trace.as_ref())?;
        send(channel, message, options.confirm).await
    }
}

async fn send(
    channel: Arc<dyn BrokerChannel>,
    message: OutboundMessage,
    confirm: bool,
) -> Result<bool, BusError> {
    let mode = if confirm { "confirm" } else { "fire_and_forget" };
    let exchange = message.exchange.clone();
    let routing_key = message.routing_key.clone();

    let pending = match channel.publish(message).await {
        Ok(pending) => pending,
        Err(e) => {
            MESSAGES_PUBLISHED.with_label_values(&[mode, "failed"]).inc();
            return Err(e.into());
        }
    };

    if !confirm {
        MESSAGES_PUBLISHED.with_label_values(&[mode, "ok"]).inc();
        return Ok(pending.accepted);
    }

    let confirmation = {
        let _timer = HistogramTimer::new(&PUBLISH_CONFIRM_DURATION);
        pending.confirmation.await
    };

    let outcome = match confirmation {
        Ok(confirmation) => confirmation.into_result(),
        Err(e) => {
            MESSAGES_PUBLISHED.with_label_values(&[mode, "failed"]).inc();
            return Err(e.into());
        }
    };
    match outcome {
        Ok(()) => {
            MESSAGES_PUBLISHED.with_label_values(&[mode, "ok"]).inc();
            Ok(true)
        }
        Err(e) => {
            MESSAGES_PUBLISHED.with_label_values(&[mode, "nacked"]).inc();
            debug!(exchange = %exchange, routing_key = %routing_key, error = %e, "Publish nacked");
            Err(e)
        }
    }
}
