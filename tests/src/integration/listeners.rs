//! # Listener Flows
//!
//! Wildcard routing, per-listener queues, cancellation and isolation of
//! malformed payloads and failing callbacks.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use bus_telemetry::HeaderCarrier;
    use messagebus::topic::{listen_topic, publish_topic, WorkspaceSubtopic, WORKSPACE_EXCHANGE};
    use messagebus::{CancellationToken, MessageBus, PublishOptions, Topic};

    use crate::integration::fixtures::{
        assert_quiet, connected_bus, eventually, fast_config, next, recorder, InstanceUpdate,
    };

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    async fn publish_update(bus: &MessageBus, topic: &str, phase: &str) {
        bus.publish(WORKSPACE_EXCHANGE, topic, &InstanceUpdate::new("i1", phase), PublishOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wildcard_listener_receives_matching_topics_only() {
        let (bus, _broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus
            .register_listener(&listen_topic(None, Some("ws-1"), None), callback)
            .await;

        publish_update(&bus, "u1.ws-1.updates", "pending").await;
        publish_update(&bus, "u2.ws-1.log", "creating").await;
        publish_update(&bus, "u1.ws-2.updates", "running").await;

        let (first, _) = next(&mut rx).await;
        let (second, _) = next(&mut rx).await;
        assert_eq!(first.routing_key, "u1.ws-1.updates");
        assert_eq!(second.routing_key, "u2.ws-1.log");
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_delivery_context_carries_parsed_topic() {
        let (bus, _broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus
            .register_listener(&listen_topic(Some("u1"), None, Some("updates")), callback)
            .await;

        publish_update(&bus, &publish_topic("u1", "ws-7", "updates"), "running").await;

        let (ctx, update) = next(&mut rx).await;
        assert_eq!(ctx.exchange, WORKSPACE_EXCHANGE);
        assert_eq!(ctx.topic, Some(Topic::new("u1", "ws-7", "updates")));
        assert_eq!(
            ctx.topic.and_then(|t| t.workspace_subtopic()),
            Some(WorkspaceSubtopic::Updates)
        );
        assert_eq!(update, InstanceUpdate::new("i1", "running"));
    }

    #[tokio::test]
    async fn test_each_listener_gets_its_own_copy() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let (mut first_rx, first) = recorder::<InstanceUpdate>();
        let (mut second_rx, second) = recorder::<InstanceUpdate>();
        let _a = bus.register_listener("#", first).await;
        let _b = bus.register_listener("*.*.updates", second).await;

        assert_eq!(broker.queue_names().len(), 2);
        publish_update(&bus, "u1.ws-1.updates", "running").await;

        next(&mut first_rx).await;
        next(&mut second_rx).await;
    }

    #[tokio::test]
    async fn test_listener_queues_are_anonymous_and_transient() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let (_rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("#", callback).await;

        let queues = broker.queue_names();
        assert_eq!(queues.len(), 1);
        let options = broker.queue_options(&queues[0]).unwrap();
        assert!(options.exclusive);
        assert!(options.auto_delete);
        assert!(!options.durable);
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery_and_releases_queue() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let handle = bus.register_listener("#", callback).await;

        handle.cancel().await;
        assert!(handle.is_cancelled());
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(broker.consumer_count(), 0);
        assert!(broker.queue_names().is_empty());
        assert!(broker.bindings().is_empty());

        publish_update(&bus, "u1.ws-1.updates", "running").await;
        assert_quiet(&mut rx).await;

        // cancelling twice is harmless
        handle.cancel().await;
    }

    #[tokio::test]
    async fn test_cancel_while_disconnected() {
        let (bus, broker) = MessageBus::in_memory(fast_config());
        let (_rx, callback) = recorder::<InstanceUpdate>();
        let handle = bus.register_listener("#", callback).await;
        assert_eq!(bus.listener_count(), 1);

        handle.cancel().await;
        assert_eq!(bus.listener_count(), 0);

        bus.connect().await.unwrap();
        assert_eq!(broker.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_listener_registered_before_connect_binds_on_connect() {
        let (bus, broker) = MessageBus::in_memory(fast_config());
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("u1.#", callback).await;
        assert_eq!(broker.consumer_count(), 0);

        bus.connect().await.unwrap();
        assert_eq!(broker.consumer_count(), 1);

        publish_update(&bus, "u1.ws-1.credit", "running").await;
        next(&mut rx).await;
    }

    #[tokio::test]
    async fn test_register_with_cancelled_token_is_noop() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let token = CancellationToken::new();
        token.cancel();

        let (_rx, callback) = recorder::<InstanceUpdate>();
        let handle = bus.register_listener_with_token("#", callback, token).await;

        assert!(handle.is_none());
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(broker.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_token_cancellation_disposes_listener() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let token = CancellationToken::new();

        let (_rx, callback) = recorder::<InstanceUpdate>();
        let handle = bus
            .register_listener_with_token("#", callback, token.clone())
            .await
            .unwrap();
        assert_eq!(broker.consumer_count(), 1);

        token.cancel();
        assert!(eventually(|| bus.listener_count() == 0 && broker.consumer_count() == 0).await);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_stop_listener() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("#", callback).await;

        broker
            .publish_raw(WORKSPACE_EXCHANGE, "u1.ws-1.updates", HeaderCarrier::new(), b"not json".to_vec())
            .unwrap();
        broker
            .publish_raw(WORKSPACE_EXCHANGE, "u1.ws-1.updates", HeaderCarrier::new(), br#"{"phase":"running"}"#.to_vec())
            .unwrap();
        publish_update(&bus, "u1.ws-1.updates", "running").await;

        let (_, update) = next(&mut rx).await;
        assert_eq!(update.phase, "running");
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_failing_callback_keeps_receiving() {
        let (bus, _broker) = connected_bus(fast_config()).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let _handle = bus
            .register_listener("#", move |_ctx, update: InstanceUpdate| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if update.phase == "bad" {
                        anyhow::bail!("cannot handle phase {}", update.phase);
                    }
                    if update.phase == "panic" {
                        panic!("listener bug");
                    }
                    anyhow::Ok(())
                }
            })
            .await;

        publish_update(&bus, "u1.ws-1.updates", "bad").await;
        publish_update(&bus, "u1.ws-1.updates", "panic").await;
        publish_update(&bus, "u1.ws-1.updates", "running").await;

        assert!(eventually(|| calls.load(Ordering::SeqCst) == 3).await);
        assert_eq!(bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_trace_context_reaches_listener() {
        let (bus, broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("#", callback).await;

        let mut headers = HeaderCarrier::new();
        headers.insert("traceparent".to_string(), TRACEPARENT.to_string());
        broker
            .publish_raw(
                WORKSPACE_EXCHANGE,
                "u1.ws-1.updates",
                headers,
                serde_json::to_vec(&InstanceUpdate::new("i1", "running")).unwrap(),
            )
            .unwrap();

        let (ctx, _) = next(&mut rx).await;
        assert!(ctx.trace.is_valid());
        assert_eq!(
            ctx.trace.trace_id().as_deref(),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
    }

    #[tokio::test]
    async fn test_delivery_without_trace_headers_has_empty_context() {
        let (bus, _broker) = connected_bus(fast_config()).await;
        let (mut rx, callback) = recorder::<InstanceUpdate>();
        let _handle = bus.register_listener("#", callback).await;

        publish_update(&bus, "u1.ws-1.updates", "running").await;

        let (ctx, _) = next(&mut rx).await;
        assert!(!ctx.trace.is_valid());
        assert_eq!(ctx.trace.trace_id(), None);
    }
}
