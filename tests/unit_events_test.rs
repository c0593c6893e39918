use helmsman::core::events::{EventBus, sink_pair, topic};
use serde_json::{Value, json};

#[tokio::test]
async fn test_publish_delivers_in_order() {
    let bus = EventBus::new();
    let (sink, mut rx) = sink_pair(16);
    bus.subscribe(sink, &[topic::CONSOLE_OUTPUT]);

    for i in 0..10 {
        bus.publish_str(topic::CONSOLE_OUTPUT, &format!("line {i}"));
    }

    for i in 0..10 {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, topic::CONSOLE_OUTPUT);
        assert_eq!(event.payload_string(), format!("line {i}"));
    }
}

#[tokio::test]
async fn test_full_sink_drops_without_blocking() {
    let bus = EventBus::new();
    let (sink, mut rx) = sink_pair(4);
    bus.subscribe(sink, &[topic::STATS]);

    // Twice the capacity; publish must not block and the surplus must be
    // dropped for this subscriber.
    for i in 0..8 {
        bus.publish(topic::STATS, json!(i));
    }

    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event.payload);
    }
    assert_eq!(received, vec![json!(0), json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_subscriber_only_gets_subscribed_topics() {
    let bus = EventBus::new();
    let (sink, mut rx) = sink_pair(16);
    bus.subscribe(sink, &[topic::STATUS]);

    bus.publish_str(topic::CONSOLE_OUTPUT, "noise");
    bus.publish_str(topic::STATUS, "running");

    let event = rx.recv().await.unwrap();
    assert_eq!(event.topic, topic::STATUS);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_duplicate_subscribe_is_single_delivery() {
    let bus = EventBus::new();
    let (sink, mut rx) = sink_pair(16);
    bus.subscribe(sink.clone(), &[topic::STATUS]);
    bus.subscribe(sink, &[topic::STATUS]);

    bus.publish_str(topic::STATUS, "starting");
    assert!(rx.recv().await.is_some());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let (sink, mut rx) = sink_pair(16);
    bus.subscribe(sink.clone(), &[topic::STATUS, topic::STATS]);
    bus.unsubscribe(&sink, &[topic::STATUS]);

    bus.publish_str(topic::STATUS, "running");
    bus.publish(topic::STATS, json!({"cpu": 1}));

    let event = rx.recv().await.unwrap();
    assert_eq!(event.topic, topic::STATS);
}

#[tokio::test]
async fn test_destroy_closes_multi_topic_subscriber_once() {
    let bus = EventBus::new();
    let (sink, mut rx) = sink_pair(16);
    // Subscribed to several topics; the receiver must observe exactly one
    // clean closure.
    bus.subscribe(sink, &[topic::STATUS, topic::STATS, topic::CONSOLE_OUTPUT]);

    bus.destroy();
    assert!(rx.recv().await.is_none());

    // Publishing after destroy is a no-op rather than a panic.
    bus.publish_str(topic::STATUS, "offline");
    assert_eq!(bus.subscriber_count(topic::STATUS), 0);
}

#[tokio::test]
async fn test_string_and_json_payload_rendering() {
    let bus = EventBus::new();
    let (sink, mut rx) = sink_pair(4);
    bus.subscribe(sink, &[topic::STATS]);

    bus.publish(topic::STATS, json!({"memory_bytes": 42}));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.payload_string(), r#"{"memory_bytes":42}"#);

    bus.publish(topic::STATS, Value::String("plain".to_string()));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.payload_string(), "plain");
}
