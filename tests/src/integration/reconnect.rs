//! # Reconnect Flows
//!
//! Connection or channel loss schedules exactly one reconnect. Every
//! registered listener is bound again before the bus reports `Ready`.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use messagebus::topic::{listen_topic, publish_topic, WORKSPACE_EXCHANGE};
    use messagebus::{BusConfig, BusError, ConnectOptions, ConnectionState, MessageBus, PublishOptions, ReconnectPolicy};
    use tokio::task::JoinHandle;

    use crate::integration::fixtures::{
        assert_quiet, connected_bus, eventually, fast_config, next, recorder, InstanceUpdate,
    };

    #[tokio::test(start_paused = true)]
    async fn test_listener_survives_connection_loss() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus
            .register_listener(&listen_topic(None, Some("ws-1"), None), callback)
            .await;

        broker.fail_connection("broker restarted");
        assert!(eventually(|| bus.reconnects_scheduled() == 1 && bus.is_connected()).await);

        bus.publish(
            WORKSPACE_EXCHANGE,
            &publish_topic("u1", "ws-1", "updates"),
            &InstanceUpdate::new("i1", "running"),
            PublishOptions::confirmed(),
        )
        .await
        .unwrap();

        let (ctx, update) = next(&mut rx).await;
        assert_eq!(ctx.routing_key, "u1.ws-1.updates");
        assert_eq!(update.phase, "running");
        assert_quiet(&mut rx).await;

        assert_eq!(broker.connections_opened(), 2);
        assert_eq!(broker.consumer_count(), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_errors_schedule_one_reconnect() {
        let (bus, broker) = connected_bus(fast_config()).await;

        broker.fail_channel("PRECONDITION_FAILED");
        broker.fail_connection("connection reset");
        assert!(eventually(|| bus.is_connected() && bus.state() == ConnectionState::Ready).await);

        assert_eq!(bus.reconnects_scheduled(), 1);
        assert_eq!(broker.connections_opened(), 2);
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_tears_down_and_reconnects() {
        let (bus, broker) = connected_bus(fast_config()).await;

        broker.fail_channel("PRECONDITION_FAILED - inequivalent arg");
        assert!(eventually(|| bus.reconnects_scheduled() == 1 && bus.is_connected()).await);

        // the old connection is closed with its channel
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_side_close_reconnects() {
        let (bus, broker) = connected_bus(fast_config()).await;

        broker.close_connection();
        assert!(eventually(|| bus.reconnects_scheduled() == 1 && bus.is_connected()).await);
        assert_eq!(bus.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_trying_until_broker_returns() {
        let (bus, broker) = connected_bus(fast_config()).await;

        // more refusals than one connect() call retries
        broker.fail_next_connects(7);
        broker.fail_connection("broker down");

        assert!(eventually(|| bus.is_connected()).await);
        assert!(bus.reconnects_scheduled() >= 3, "{}", bus.reconnects_scheduled());
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_while_reconnecting_fails_fast() {
        let config = BusConfig {
            reconnect: ReconnectPolicy::starting_at(Duration::from_secs(5)),
            ..fast_config()
        };
        let (bus, broker) = connected_bus(config).await;

        broker.fail_connection("network partition");
        assert!(eventually(|| matches!(bus.state(), ConnectionState::Reconnecting { .. })).await);

        let result = bus
            .publish(WORKSPACE_EXCHANGE, "u1.ws-1.log", &"line", PublishOptions::default())
            .await;
        assert_eq!(result, Err(BusError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_registered_while_reconnecting_binds_later() {
        let config = BusConfig {
            reconnect: ReconnectPolicy::starting_at(Duration::from_secs(1)),
            ..fast_config()
        };
        let (bus, broker) = connected_bus(config).await;

        broker.fail_connection("broker restarted");
        assert!(eventually(|| !bus.is_connected()).await);

        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("*.ws-2.updates", callback).await;
        assert_eq!(broker.consumer_count(), 0);

        assert!(eventually(|| bus.is_connected()).await);
        assert_eq!(broker.consumer_count(), 1);

        bus.publish(
            WORKSPACE_EXCHANGE,
            "u9.ws-2.updates",
            &InstanceUpdate::new("i2", "stopping"),
            PublishOptions::default(),
        )
        .await
        .unwrap();
        let (_, update) = next(&mut rx).await;
        assert_eq!(update.instance_id, "i2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let config = BusConfig {
            reconnect: ReconnectPolicy::starting_at(Duration::from_secs(5)),
            ..fast_config()
        };
        let (bus, broker) = connected_bus(config).await;

        broker.fail_connection("broker down");
        assert!(eventually(|| matches!(bus.state(), ConnectionState::Reconnecting { .. })).await);

        bus.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(bus.state(), ConnectionState::Closed);
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_is_reported_in_state() {
        let config = BusConfig {
            reconnect: ReconnectPolicy {
                jitter_ratio: 0.0,
                ..ReconnectPolicy::starting_at(Duration::from_secs(3))
            },
            ..fast_config()
        };
        let (bus, broker) = connected_bus(config).await;

        broker.fail_connection("broker down");
        assert!(eventually(|| matches!(bus.state(), ConnectionState::Reconnecting { .. })).await);
        assert_eq!(
            bus.state(),
            ConnectionState::Reconnecting {
                delay: Duration::from_secs(3)
            }
        );
    }

    #[tokio::test]
    async fn test_manual_connect_joins_scheduled_reconnect() {
        let config = BusConfig {
            reconnect: ReconnectPolicy::starting_at(Duration::from_secs(30)),
            ..fast_config()
        };
        let (bus, broker) = connected_bus(config).await;

        broker.fail_connection("broker restarted");
        assert!(eventually(|| !bus.is_connected()).await);

        // an explicit connect() does not wait for the timer
        bus.connect().await.unwrap();
        assert!(bus.is_connected());
        assert_eq!(broker.connections_opened(), 2);
        assert_eq!(bus.reconnects_scheduled(), 1);
    }

    #[tokio::test]
    async fn test_fresh_bus_never_schedules_reconnect() {
        let (bus, _broker) = MessageBus::in_memory(fast_config());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.reconnects_scheduled(), 0);
        assert_eq!(bus.state(), ConnectionState::Disconnected);
    }

    /// Every state published after this call, up to and including the next `Ready`.
    fn states_until_ready(bus: &MessageBus) -> JoinHandle<Vec<ConnectionState>> {
        let mut states = bus.subscribe_state();
        states.borrow_and_update();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                let ready = state == ConnectionState::Ready;
                seen.push(state);
                if ready {
                    break;
                }
            }
            seen
        })
    }

    fn reconnect_delays(states: &[ConnectionState]) -> Vec<Duration> {
        states
            .iter()
            .filter_map(|state| match state {
                ConnectionState::Reconnecting { delay } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_watch_follows_reconnect_cycle() {
        let (bus, broker) = connected_bus(fast_config()).await;
        assert_eq!(*bus.subscribe_state().borrow(), ConnectionState::Ready);
        let recording = states_until_ready(&bus);

        broker.fail_connection("broker restarted");
        let seen = tokio::time::timeout(Duration::from_secs(5), recording)
            .await
            .expect("bus never became ready again")
            .unwrap();

        let observed: Vec<_> = seen
            .iter()
            .filter(|state| !matches!(state, ConnectionState::Connecting))
            .collect();
        assert_eq!(observed.len(), 2, "{seen:?}");
        assert!(matches!(observed[0], ConnectionState::Reconnecting { .. }), "{seen:?}");
        assert_eq!(observed[1], &ConnectionState::Ready);
        assert!(bus.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_grows_caps_and_resets() {
        let max_delay = Duration::from_secs(5);
        let config = BusConfig {
            connect: ConnectOptions {
                retries: 1,
                ..fast_config().connect
            },
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_secs(1),
                multiplier: 2.0,
                jitter_ratio: 0.0,
                max_delay,
            },
            ..fast_config()
        };
        let (bus, broker) = connected_bus(config).await;

        let recording = states_until_ready(&bus);
        broker.fail_next_connects(4);
        broker.fail_connection("broker down");
        let seen = tokio::time::timeout(Duration::from_secs(60), recording)
            .await
            .expect("bus never became ready again")
            .unwrap();

        let delays = reconnect_delays(&seen);
        assert_eq!(
            delays,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec(),
            "{seen:?}"
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= max_delay));
        assert_eq!(bus.reconnects_scheduled(), 5);

        // a successful reconnect starts the next outage from the initial delay
        let recording = states_until_ready(&bus);
        broker.fail_connection("broker down again");
        let seen = tokio::time::timeout(Duration::from_secs(60), recording)
            .await
            .expect("bus never became ready again")
            .unwrap();
        assert_eq!(reconnect_delays(&seen), vec![Duration::from_secs(1)]);
    }
}
