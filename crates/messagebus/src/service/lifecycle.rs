//! # Connection/Channel Lifecycle
//!
//! Owns the single logical connection and channel.
//!
//! ## Sessions
//!
//! Every connect attempt gets a fresh epoch. A session (connection, channel,
//! event watcher) is only installed after the exchange is declared, durable
//! queues are asserted and every listener is re-bound. Transport events carry
//! the epoch of the session they belong to; events of a session that has
//! already been torn down are ignored.
//!
//! ## Joined connects
//!
//! At most one connect attempt runs at a time. It is spawned as its own task
//! and shared, so concurrent `connect()` callers (including the reconnect
//! scheduler) await the same outcome.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bus_telemetry::metrics::{Gauge, CONNECTION_READY, CONNECT_ATTEMPTS, LISTENERS_BOUND};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::ListenerRegistry;
use super::reconnect::ReconnectState;
use crate::config::{BusConfig, ConnectOptions};
use crate::domain::{BusError, ConnectionState, TransportError};
use crate::ports::{BrokerChannel, BrokerConnection, BrokerTransport, QueueOptions, TransportEvent};

type SharedAttempt = Shared<BoxFuture<'static, Result<(), BusError>>>;

/// A live connection/channel pair.
pub(crate) struct Session {
    pub(crate) epoch: u64,
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    /// Stops the event watcher.
    watcher: CancellationToken,
}

/// State shared by a [`crate::MessageBus`] and its background tasks.
pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) transport: Arc<dyn BrokerTransport>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    session: Mutex<Option<Session>>,
    attempt: Mutex<Option<(u64, SharedAttempt)>>,
    pub(crate) reconnect: Mutex<ReconnectState>,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    attempt_ids: AtomicU64,
    shut_down: AtomicBool,
    /// Process-wide. Moved by one per installed or closed session.
    ready_gauge: Gauge,
}

impl BusInner {
    pub(crate) fn new(config: BusConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        Self::with_gauges(config, transport, CONNECTION_READY.clone(), LISTENERS_BOUND.clone())
    }

    pub(crate) fn with_gauges(
        config: BusConfig,
        transport: Arc<dyn BrokerTransport>,
        ready_gauge: Gauge,
        bound_gauge: Gauge,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let reconnect = ReconnectState::new(config.reconnect.backoff());
        Self {
            config,
            transport,
            listeners: Arc::new(ListenerRegistry::with_gauge(bound_gauge)),
            session: Mutex::new(None),
            attempt: Mutex::new(None),
            reconnect: Mutex::new(reconnect),
            state,
            epoch: AtomicU64::new(0),
            attempt_ids: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            ready_gauge,
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Channel and epoch of the current session.
    pub(crate) fn current_channel(&self) -> Option<(u64, Arc<dyn BrokerChannel>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.epoch, Arc::clone(&s.channel)))
    }

    /// Channel of the current session, or the error a caller should see.
    pub(crate) fn ready_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        self.current_channel()
            .map(|(_, channel)| channel)
            .ok_or(BusError::NotConnected)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `Closed` is terminal.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Connection state changed");
            *current = next;
            true
        });
    }

    // -------------------------------------------------------------------------
    // Connect
    // -------------------------------------------------------------------------

    /// Join the in-flight connect attempt, or start one.
    pub(crate) async fn connect(self: &Arc<Self>, options: ConnectOptions) -> Result<(), BusError> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }

        let attempt = {
            let mut slot = self.attempt.lock();
            match slot.as_ref() {
                Some((_, attempt)) => attempt.clone(),
                None => {
                    let id = self.attempt_ids.fetch_add(1, Ordering::Relaxed) + 1;
                    let inner = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let result = inner.connect_with_retries(options).await;
                        inner.clear_attempt(id);
                        result
                    });
                    let attempt = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(BusError::Connection(format!("connect task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, attempt.clone()));
                    attempt
                }
            }
        };

        attempt.await
    }

    fn clear_attempt(&self, id: u64) {
        let mut slot = self.attempt.lock();
        if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
            *slot = None;
        }
    }

    async fn connect_with_retries(self: &Arc<Self>, options: ConnectOptions) -> Result<(), BusError> {
        if self.is_connected() {
            self.settle_connected();
            return Ok(());
        }

        let attempts = options.retries.max(1);
        info!(url = %self.transport.describe(), "Connecting to message bus");
        self.set_state(ConnectionState::Connecting);

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if self.is_shut_down() {
                return Err(BusError::ShutDown);
            }
            match self.connect_once(options).await {
                Ok(()) => {
                    CONNECT_ATTEMPTS.with_label_values(&["success"]).inc();
                    self.settle_connected();
                    return Ok(());
                }
                Err(BusError::ShutDown) => return Err(BusError::ShutDown),
                Err(e) => {
                    CONNECT_ATTEMPTS.with_label_values(&["failed"]).inc();
                    debug!(attempt, attempts, error = %e, "Connect attempt failed, retrying");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(options.retry_delay).await;
                    }
                }
            }
        }

        warn!(attempts, error = %last_error, "Unable to connect to message bus");
        self.set_state(ConnectionState::Disconnected);
        Err(BusError::ConnectFailed {
            attempts,
            last_error,
        })
    }

    /// Report `Ready` and drop any pending reconnect, if a session is live.
    ///
    /// Runs under the reconnect lock so a reconnect scheduled by a concurrent
    /// teardown cannot leave `Reconnecting` behind a live session.
    fn settle_connected(&self) {
        let mut reconnect = self.reconnect.lock();
        if !self.is_connected() {
            return;
        }
        reconnect.backoff.reset();
        reconnect.cancel_timer();
        self.set_state(ConnectionState::Ready);
    }

    /// One attempt: open the connection, set up the channel, install the session.
    async fn connect_once(self: &Arc<Self>, options: ConnectOptions) -> Result<(), BusError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (events, event_rx) = mpsc::unbounded_channel();

        let connection =
            match tokio::time::timeout(options.connect_timeout, self.transport.connect(events)).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => return Err(BusError::Connection(e.to_string())),
                Err(_) => {
                    let timeout = TransportError::Timeout(options.connect_timeout.as_millis() as u64);
                    return Err(BusError::Connection(timeout.to_string()));
                }
            };

        let channel = match self.establish(epoch, &connection).await {
            Ok(channel) => channel,
            Err(e) => {
                self.listeners.unbind_all();
                close_quietly(None, &connection).await;
                return Err(BusError::Connection(e.to_string()));
            }
        };

        let watcher = CancellationToken::new();
        let installed = {
            let mut session = self.session.lock();
            if self.is_shut_down() {
                false
            } else {
                *session = Some(Session {
                    epoch,
                    connection: Arc::clone(&connection),
                    channel: Arc::clone(&channel),
                    watcher: watcher.clone(),
                });
                true
            }
        };
        if !installed {
            self.listeners.unbind_all();
            close_quietly(Some(&channel), &connection).await;
            return Err(BusError::ShutDown);
        }
        self.ready_gauge.inc();
        tokio::spawn(watch_session(Arc::downgrade(self), epoch, event_rx, watcher));

        // listeners registered while the channel was being set up
        for id in self.listeners.ids() {
            if let Err(e) = self.listeners.bind(id, epoch, &channel, &self.config.exchange).await {
                warn!(listener = %id, error = %e, "Failed to bind listener");
            }
        }

        info!(
            url = %self.transport.describe(),
            listeners = self.listeners.len(),
            bound = self.listeners.bound(),
            "Connected to message bus"
        );
        debug!(epoch, selectors = ?self.listeners.selectors(), "Listeners bound");
        Ok(())
    }

    /// Open the channel and restore broker-side state on it.
    async fn establish(
        &self,
        epoch: u64,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = connection.open_channel().await?;
        channel
            .declare_topic_exchange(&self.config.exchange, true)
            .await?;
        for queue in &self.config.durable_queues {
            channel.declare_queue(queue, QueueOptions::durable()).await?;
        }
        self.listeners
            .bind_all(epoch, &channel, &self.config.exchange)
            .await?;
        Ok(channel)
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Take the current session, if it still belongs to `epoch`.
    fn take_session(&self, epoch: Option<u64>) -> Option<Session> {
        let mut session = self.session.lock();
        match (session.as_ref(), epoch) {
            (Some(current), Some(epoch)) if current.epoch != epoch => None,
            _ => session.take(),
        }
    }

    async fn close_session(&self, session: Session) {
        session.watcher.cancel();
        self.listeners.unbind_all();
        self.ready_gauge.dec();
        close_quietly(Some(&session.channel), &session.connection).await;
    }

    async fn handle_transport_event(self: &Arc<Self>, epoch: u64, event: TransportEvent) {
        let Some(session) = self.take_session(Some(epoch)) else {
            debug!(epoch, ?event, "Ignoring event of a closed session");
            return;
        };

        match &event {
            TransportEvent::ConnectionError(reason) => {
                warn!(reason = %reason, "Connection error, reconnecting");
            }
            TransportEvent::ConnectionClosed => info!("Connection closed, reconnecting"),
            TransportEvent::ChannelError(reason) => {
                warn!(reason = %reason, "Channel error, reconnecting");
            }
        }

        self.close_session(session).await;
        if !self.is_shut_down() {
            self.schedule_reconnect();
        }
    }

    /// Close the channel, then the connection, and stop all background work.
    pub(crate) async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reconnect.lock().cancel_timer();

        if let Some(session) = self.take_session(None) {
            self.close_session(session).await;
        }
        self.listeners.clear();
        self.set_state(ConnectionState::Closed);
        info!("Message bus shut down");
    }
}

async fn close_quietly(channel: Option<&Arc<dyn BrokerChannel>>, connection: &Arc<dyn BrokerConnection>) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Error closing channel");
        }
    }
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Error closing connection");
    }
}

/// Forward the first transport event of a session to the bus.
async fn watch_session(
    inner: Weak<BusInner>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    stop: CancellationToken,
) {
    let event = tokio::select! {
        _ = stop.cancelled() => return,
        event = events.recv() => event,
    };
    let Some(event) = event else {
        return;
    };
    if let Some(inner) = inner.upgrade() {
        inner.handle_transport_event(epoch, event).await;
    }
}
