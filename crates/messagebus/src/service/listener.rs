//! # Listener Registry
//!
//! Subscription intents that outlive any single connection.
//!
//! ## Binding protocol (per ready channel)
//!
//! ```text
//! declare anonymous queue (exclusive, auto-delete) -> bind(exchange, selector)
//!     -> consume (manual ack) -> pump task: ack, forward to dispatcher
//! ```
//!
//! Each listener owns one dispatcher task that decodes and runs the callback,
//! so a slow callback never stalls the pump and messages of one queue reach
//! the callback in broker order.
//!
//! Entries are keyed by a monotonically increasing id, so iteration order is
//! registration order. A per-entry claim on the session epoch makes sure at
//! most one bind runs for an entry per session.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bus_telemetry::metrics::{Gauge, LISTENERS_BOUND, LISTENER_FAILURES, MALFORMED_MESSAGES, MESSAGES_RECEIVED};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::domain::{Delivery, DeliveryContext, TransportError};
use crate::ports::{BrokerChannel, Consumer, QueueOptions};

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Broker resources of a bound listener.
struct Binding {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    /// Stops the pump task.
    stop: CancellationToken,
}

struct ListenerEntry {
    selector: String,
    dispatch: mpsc::UnboundedSender<Delivery>,
    /// Cancelled when the listener is disposed.
    lifetime: CancellationToken,
    /// Highest session epoch a bind was started for.
    claimed_epoch: u64,
    binding: Option<Binding>,
}

/// Ordered set of listeners, shared by the bus and its handles.
pub(crate) struct ListenerRegistry {
    entries: Mutex<BTreeMap<ListenerId, ListenerEntry>>,
    next_id: AtomicU64,
    /// Process-wide. Moved only by this registry's binding transitions.
    bound_gauge: Gauge,
}

impl ListenerRegistry {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::with_gauge(LISTENERS_BOUND.clone())
    }

    pub(crate) fn with_gauge(bound_gauge: Gauge) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            bound_gauge,
        }
    }

    /// Add a listener and start its dispatcher. Nothing is bound yet.
    pub(crate) fn insert<T, F, Fut>(self: &Arc<Self>, selector: &str, callback: F) -> ListenerHandle
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(DeliveryContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (dispatch, deliveries) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();

        tokio::spawn(dispatch_loop(
            id,
            selector.to_string(),
            deliveries,
            lifetime.clone(),
            callback,
        ));

        self.entries.lock().insert(
            id,
            ListenerEntry {
                selector: selector.to_string(),
                dispatch,
                lifetime: lifetime.clone(),
                claimed_epoch: 0,
                binding: None,
            },
        );
        debug!(listener = %id, selector = %selector, "Listener registered");

        ListenerHandle {
            id,
            registry: Arc::clone(self),
            lifetime,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn ids(&self) -> Vec<ListenerId> {
        self.entries.lock().keys().copied().collect()
    }

    /// Selectors in registration order.
    pub(crate) fn selectors(&self) -> Vec<String> {
        self.entries
            .lock()
            .values()
            .map(|e| e.selector.clone())
            .collect()
    }

    /// Bind one listener on `channel` for session `epoch`.
    ///
    /// No-op if the entry is gone or a bind for this epoch already started.
    pub(crate) async fn bind(
        &self,
        id: ListenerId,
        epoch: u64,
        channel: &Arc<dyn BrokerChannel>,
        exchange: &str,
    ) -> Result<(), TransportError> {
        let (selector, dispatch, lifetime) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return Ok(());
            };
            if entry.claimed_epoch >= epoch {
                return Ok(());
            }
            entry.claimed_epoch = epoch;
            (
                entry.selector.clone(),
                entry.dispatch.clone(),
                entry.lifetime.clone(),
            )
        };

        let queue = channel.declare_queue("", QueueOptions::anonymous()).await?;
        channel.bind_queue(&queue, exchange, &selector).await?;
        let consumer = channel.consume(&queue).await?;

        let consumer_tag = consumer.tag.clone();
        let stop = lifetime.child_token();
        tokio::spawn(pump(
            id,
            Arc::clone(channel),
            consumer,
            dispatch,
            stop.clone(),
        ));

        let binding = Binding {
            queue,
            consumer_tag,
            channel: Arc::clone(channel),
            stop,
        };

        // The entry may have been cancelled while binding.
        let orphan = {
            let mut entries = self.entries.lock();
            let orphan = match entries.get_mut(&id) {
                Some(entry) => {
                    match entry.binding.replace(binding) {
                        Some(previous) => previous.stop.cancel(),
                        None => self.bound_gauge.inc(),
                    }
                    None
                }
                None => Some(binding),
            };
            orphan
        };

        match orphan {
            Some(orphan) => {
                orphan.stop.cancel();
                release(id, orphan).await;
            }
            None => debug!(listener = %id, selector = %selector, "Listener bound"),
        }
        Ok(())
    }

    /// Bind every entry, in registration order. Stops at the first failure.
    pub(crate) async fn bind_all(
        &self,
        epoch: u64,
        channel: &Arc<dyn BrokerChannel>,
        exchange: &str,
    ) -> Result<(), TransportError> {
        for id in self.ids() {
            self.bind(id, epoch, channel, exchange).await?;
        }
        Ok(())
    }

    /// Forget all bindings after their channel died. No broker calls.
    pub(crate) fn unbind_all(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            if let Some(binding) = entry.binding.take() {
                binding.stop.cancel();
                self.bound_gauge.dec();
            }
        }
    }

    /// Listeners holding a binding on a live channel.
    pub(crate) fn bound(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.binding.is_some())
            .count()
    }

    fn remove(&self, id: ListenerId) -> Option<ListenerEntry> {
        let entry = self.entries.lock().remove(&id);
        if matches!(&entry, Some(e) if e.binding.is_some()) {
            self.bound_gauge.dec();
        }
        entry
    }

    /// Remove a listener and release its broker resources. Idempotent.
    pub(crate) async fn cancel(&self, id: ListenerId) {
        let Some(entry) = self.remove(id) else {
            return;
        };
        entry.lifetime.cancel();
        if let Some(binding) = entry.binding {
            release(id, binding).await;
        }
        debug!(listener = %id, selector = %entry.selector, "Listener cancelled");
    }

    /// Dispose every listener. Broker resources are left to the closing channel.
    pub(crate) fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in std::mem::take(&mut *entries) {
            entry.lifetime.cancel();
            if entry.binding.is_some() {
                self.bound_gauge.dec();
            }
        }
    }
}

/// Cancel the consumer and delete the queue. A closed channel is expected.
async fn release(id: ListenerId, binding: Binding) {
    let Binding {
        queue,
        consumer_tag,
        channel,
        ..
    } = binding;

    if let Err(e) = channel.cancel(&consumer_tag).await {
        log_cleanup_error(id, "cancel consumer", &e);
    }
    if let Err(e) = channel.delete_queue(&queue).await {
        log_cleanup_error(id, "delete queue", &e);
    }
}

fn log_cleanup_error(id: ListenerId, step: &str, error: &TransportError) {
    if error.is_channel_closed() {
        debug!(listener = %id, step, "Channel already closed during cleanup");
    } else {
        warn!(listener = %id, step, error = %error, "Listener cleanup failed");
    }
}

/// Acknowledge each delivery on receipt and hand it to the dispatcher.
async fn pump(
    id: ListenerId,
    channel: Arc<dyn BrokerChannel>,
    mut consumer: Consumer,
    dispatch: mpsc::UnboundedSender<Delivery>,
    stop: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = stop.cancelled() => break,
            next = consumer.deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        MESSAGES_RECEIVED.inc();

        if let Err(e) = channel.ack(delivery.delivery_tag).await {
            debug!(listener = %id, error = %e, "Ack failed");
        }
        if dispatch.send(delivery).is_err() {
            break;
        }
    }
    debug!(listener = %id, consumer = %consumer.tag, "Consumer loop stopped");
}

/// Decode and run the callback for each delivery, one at a time.
async fn dispatch_loop<T, F, Fut>(
    id: ListenerId,
    selector: String,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    lifetime: CancellationToken,
    callback: F,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(DeliveryContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    loop {
        let delivery = tokio::select! {
            _ = lifetime.cancelled() => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let payload: T = match delivery.decode() {
            Ok(payload) => payload,
            Err(e) => {
                MALFORMED_MESSAGES.inc();
                warn!(
                    listener = %id,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Dropping malformed message"
                );
                continue;
            }
        };

        let context = delivery.context();
        let span = context
            .trace
            .delivery_span(&delivery.exchange, &delivery.routing_key);

        let outcome = AssertUnwindSafe(async { callback(context, payload).await })
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                LISTENER_FAILURES.inc();
                error!(listener = %id, selector = %selector, error = %e, "Listener callback failed");
            }
            Err(_) => {
                LISTENER_FAILURES.inc();
                error!(listener = %id, selector = %selector, "Listener callback panicked");
            }
        }
    }
    debug!(listener = %id, "Dispatcher stopped");
}

/// Cancellation handle returned by listener registration.
///
/// Dropping the handle does not cancel the listener.
pub struct ListenerHandle {
    id: ListenerId,
    registry: Arc<ListenerRegistry>,
    lifetime: CancellationToken,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Remove the listener and release its broker resources.
    ///
    /// Safe at any time, including while disconnected or mid-reconnect.
    /// Idempotent.
    pub async fn cancel(&self) {
        self.registry.cancel(self.id).await;
    }

    /// Token cancelled once the listener is disposed.
    pub(crate) fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
