//! # Publish Gateway Flows
//!
//! Fire-and-forget returns once the transport accepted the message; confirm
//! mode waits for the broker's ack or nack.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bus_telemetry::metrics::MESSAGES_PUBLISHED;
    use bus_telemetry::HeaderCarrier;
    use messagebus::topic::{publish_topic, PREBUILD_UPDATABLE_QUEUE, WORKSPACE_EXCHANGE, WORKSPACE_LOCAL_EXCHANGE};
    use messagebus::{BusConfig, BusError, ConfirmBehavior, MessageBus, PublishOptions, TraceContext, TransportError};
    use tokio::time::timeout;

    use crate::integration::fixtures::{connected_bus, fast_config, next, recorder, InstanceUpdate};

    fn update() -> InstanceUpdate {
        InstanceUpdate::new("i1", "running")
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_listener() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("*.ws-1.*", callback).await;

        let accepted = bus
            .publish(WORKSPACE_EXCHANGE, &publish_topic("u1", "ws-1", "updates"), &update(), PublishOptions::default())
            .await
            .unwrap();

        assert!(accepted);
        assert_eq!(broker.published_count(), 1);
        let (_, received) = next(&mut rx).await;
        assert_eq!(received, update());
    }

    #[tokio::test]
    async fn test_confirmed_publish_acked() {
        let (bus, _broker) = connected_bus(fast_config()).await;

        let result = bus
            .publish(WORKSPACE_EXCHANGE, "u1.ws-1.updates", &update(), PublishOptions::confirmed())
            .await;

        assert_eq!(result, Ok(true));
    }

    #[tokio::test]
    async fn test_confirmed_publish_nacked() {
        let (bus, broker) = connected_bus(fast_config()).await;
        broker.set_confirm_behavior(ConfirmBehavior::Nack("queue full".to_string()));
        let nacked = MESSAGES_PUBLISHED.with_label_values(&["confirm", "nacked"]);
        let before = nacked.get();

        let result = bus
            .publish(WORKSPACE_EXCHANGE, "u1.ws-1.updates", &update(), PublishOptions::confirmed())
            .await;

        assert_eq!(
            result,
            Err(BusError::PublishNacked {
                reason: "queue full".to_string()
            })
        );
        assert!(nacked.get() >= before + 1.0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_does_not_wait_for_broker() {
        let (bus, broker) = connected_bus(fast_config()).await;
        broker.set_confirm_behavior(ConfirmBehavior::Hold);

        let result = timeout(
            Duration::from_millis(200),
            bus.publish(WORKSPACE_EXCHANGE, "u1.ws-1.log", &"log line", PublishOptions::default()),
        )
        .await
        .expect("fire-and-forget publish must not wait for a confirm");

        assert_eq!(result, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_waits_for_broker_ack() {
        let (bus, broker) = connected_bus(fast_config()).await;
        broker.set_confirm_behavior(ConfirmBehavior::Delay(Duration::from_millis(500)));

        let started = tokio::time::Instant::now();
        let result = bus
            .publish(WORKSPACE_EXCHANGE, "u1.ws-1.updates", &update(), PublishOptions::confirmed())
            .await;

        assert_eq!(result, Ok(true));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_exchange_fails() {
        let (bus, _broker) = connected_bus(fast_config()).await;

        let result = bus
            .publish(WORKSPACE_LOCAL_EXCHANGE, "u1.ws-1.updates", &update(), PublishOptions::default())
            .await;

        assert!(
            matches!(result, Err(BusError::Transport(TransportError::Broker(ref reason))) if reason.contains("NOT_FOUND")),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn test_publish_to_durable_queue() {
        let config = BusConfig {
            durable_queues: vec![PREBUILD_UPDATABLE_QUEUE.to_string()],
            ..fast_config()
        };
        let (bus, broker) = connected_bus(config).await;

        bus.publish_to_queue(PREBUILD_UPDATABLE_QUEUE, &update(), PublishOptions::confirmed())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth(PREBUILD_UPDATABLE_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_assert_durable_queue_on_ready_channel() {
        let (bus, broker) = connected_bus(fast_config()).await;

        bus.assert_durable_queue("workspace-cleanup").await.unwrap();

        assert!(broker.queue_options("workspace-cleanup").unwrap().durable);
    }

    #[tokio::test]
    async fn test_assert_durable_queue_requires_connection() {
        let (bus, _broker) = MessageBus::in_memory(fast_config());
        assert_eq!(bus.assert_durable_queue("q").await, Err(BusError::NotConnected));
    }

    #[tokio::test]
    async fn test_publish_injects_trace_headers() {
        let (bus, _broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("#", callback).await;

        let mut headers = HeaderCarrier::new();
        headers.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );
        let trace = TraceContext::extract(&headers);
        assert!(trace.is_valid());

        bus.publish(
            WORKSPACE_EXCHANGE,
            "u1.ws-1.updates",
            &update(),
            PublishOptions::default().with_trace(trace),
        )
        .await
        .unwrap();

        let (ctx, _) = next(&mut rx).await;
        assert_eq!(
            ctx.trace.trace_id().as_deref(),
            Some("0af7651916cd43dd8448eb211c80319c")
        );
    }

    #[tokio::test]
    async fn test_unserializable_payload_rejected() {
        use std::collections::HashMap;

        let (bus, broker) = connected_bus(fast_config()).await;
        // JSON object keys must be strings
        let mut payload: HashMap<(u8, u8), u8> = HashMap::new();
        payload.insert((1, 2), 3);

        let result = bus
            .publish(WORKSPACE_EXCHANGE, "u1.ws-1.updates", &payload, PublishOptions::default())
            .await;

        assert!(matches!(result, Err(BusError::Serialization(_))), "{result:?}");
        assert_eq!(broker.published_count(), 0);
    }
}
