//! # Reconnect Scheduler
//!
//! At most one reconnect timer per bus. A second request while a timer is
//! pending, or after another `connect()` already installed a new session, is
//! dropped. When the timer fires it joins `connect()`; on failure
//! it schedules itself again with the grown delay.

use std::sync::Arc;

use bus_telemetry::metrics::RECONNECTS_SCHEDULED;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lifecycle::BusInner;
use crate::domain::{Backoff, ConnectionState};

pub(crate) struct ReconnectState {
    pub(crate) backoff: Backoff,
    timer: Option<JoinHandle<()>>,
    scheduled: u64,
}

impl ReconnectState {
    pub(crate) fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            timer: None,
            scheduled: 0,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.timer.is_some()
    }

    /// Reconnects scheduled over the lifetime of the bus.
    pub(crate) fn scheduled(&self) -> u64 {
        self.scheduled
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl BusInner {
    /// Schedule a reconnect unless one is already pending.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        let mut reconnect = self.reconnect.lock();
        if reconnect.is_pending() {
            debug!("Reconnect already scheduled, dropping request");
            return;
        }
        if self.is_shut_down() {
            return;
        }
        if self.is_connected() {
            debug!("Session already re-established, dropping reconnect request");
            return;
        }

        let delay = reconnect.backoff.next_sleep();
        reconnect.scheduled += 1;
        RECONNECTS_SCHEDULED.inc();
        info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.set_state(ConnectionState::Reconnecting { delay });

        let inner = Arc::downgrade(self);
        reconnect.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.reconnect.lock().timer = None;

            let options = inner.config.connect;
            match inner.connect(options).await {
                Ok(()) => info!("Reconnected to message bus"),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Reconnect failed, rescheduling");
                    inner.schedule_reconnect();
                }
                Err(e) => debug!(error = %e, "Reconnect abandoned"),
            }
        }));
    }
}
