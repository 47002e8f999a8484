use super::*;
use crate::keycloak::{AdminEvent, AuthDetails, Event, EventType, HostEvent, OperationType};
use crate::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::channel;
use std::time::Duration;

fn create_test_event() -> Event {
    Event::new(EventType::Register, "test-realm")
        .with_id("evt-42")
        .with_time(1_234_567_890)
        .with_client("account-console")
        .with_user("u-42")
        .with_session("s-42")
        .with_ip("192.168.0.7")
        .with_detail("email", "testuser@test.com")
}

fn create_admin_event() -> AdminEvent {
    AdminEvent::new(
        OperationType::Update,
        "REALM",
        "events/config",
        AuthDetails::new("master"),
    )
    .with_representation(r#"{"eventsEnabled":true,"adminEventsEnabled":true}"#)
}

fn build_message(
    router: &TopicRouter,
    strategy: KeyStrategy,
    serializer: &dyn EventSerializer,
    event: HostEvent<'_>,
) -> WireMessage {
    WireMessage {
        topic: router.topic_for(event).to_string(),
        key: strategy.extract_key(event),
        payload: serializer.serialize(event).unwrap(),
    }
}

#[test]
fn test_pipeline_for_standard_event() {
    let router = TopicRouter::new("keycloak-events", "keycloak-admin-events").unwrap();
    let serializer = JsonSerializer::new(SerializationFormat::Json);
    let event = create_test_event();

    let message = build_message(&router, KeyStrategy::User, &serializer, HostEvent::Standard(&event));
    assert_eq!(message.topic, "keycloak-events");
    assert_eq!(message.key.as_deref(), Some("u-42"));

    let parsed: Value = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(parsed["type"], "REGISTER");
    assert_eq!(parsed["sessionId"], "s-42");
    assert_eq!(parsed["details"]["email"], "testuser@test.com");
}

#[test]
fn test_pipeline_for_realm_config_admin_event() {
    let router = TopicRouter::new("keycloak-events", "keycloak-admin-events").unwrap();
    let serializer = JsonSerializer::new(SerializationFormat::Json);
    let event = create_admin_event();
    let host = HostEvent::Admin {
        event: &event,
        include_representation: true,
    };

    let message = build_message(&router, KeyStrategy::User, &serializer, host);
    assert_eq!(message.topic, "keycloak-admin-events");
    // Not a user resource, so ordering falls back to the realm.
    assert_eq!(message.key.as_deref(), Some("master"));

    let parsed: Value = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(parsed["resourceType"], "REALM");
    assert_eq!(parsed["representation"]["adminEventsEnabled"], true);
}

#[test]
fn test_memory_provider_round_trip() {
    let broker = MemoryBroker::new();
    let provider = MemoryProducerProvider::new(broker.clone());
    let producer = provider
        .create_producer("keycloak", "kafka:9092", &HashMap::new())
        .unwrap();

    let router = TopicRouter::new("keycloak-events", "keycloak-admin-events").unwrap();
    let serializer = JsonSerializer::default();
    let event = create_test_event();
    let message = build_message(&router, KeyStrategy::Realm, &serializer, HostEvent::Standard(&event));

    let (tx, rx) = channel();
    producer
        .send(
            message.clone(),
            Box::new(move |result| {
                let _ = tx.send(result.map(|receipt| receipt.topic));
            }),
        )
        .unwrap();

    let topic = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(topic, "keycloak-events");
    assert_eq!(broker.messages(), vec![message]);
    producer.close();
}

#[test]
#[ignore] // Requires running Kafka
fn test_kafka_producer_send() {
    let brokers =
        std::env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    let provider = KafkaProducerProvider::new(Duration::from_secs(10));
    let producer = provider
        .create_producer("keycloak-test", &brokers, &HashMap::new())
        .unwrap();

    let (tx, rx) = channel();
    producer
        .send(
            WireMessage {
                topic: "keycloak-events".to_string(),
                key: Some("test-realm".to_string()),
                payload: "Hello, Kafka!".to_string(),
            },
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();

    producer.flush(Duration::from_secs(10)).unwrap();
    let receipt = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(receipt.topic, "keycloak-events");
    assert!(receipt.offset >= 0);
    producer.close();
}

#[test]
fn test_rdkafka_log_level_follows_tracing_filter() {
    use rdkafka::config::RDKafkaLogLevel;
    use tracing::level_filters::LevelFilter;

    assert!(matches!(
        producer::rdkafka_log_level(LevelFilter::TRACE),
        RDKafkaLogLevel::Debug
    ));
    assert!(matches!(
        producer::rdkafka_log_level(LevelFilter::DEBUG),
        RDKafkaLogLevel::Debug
    ));
    assert!(matches!(
        producer::rdkafka_log_level(LevelFilter::INFO),
        RDKafkaLogLevel::Info
    ));
    assert!(matches!(
        producer::rdkafka_log_level(LevelFilter::WARN),
        RDKafkaLogLevel::Warning
    ));
    assert!(matches!(
        producer::rdkafka_log_level(LevelFilter::ERROR),
        RDKafkaLogLevel::Error
    ));
    assert!(matches!(
        producer::rdkafka_log_level(LevelFilter::OFF),
        RDKafkaLogLevel::Emerg
    ));
}

#[test]
fn test_kafka_producer_rejects_sends_racing_close() {
    use rdkafka::producer::ThreadedProducer;
    use rdkafka::ClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    // Nothing listens on port 1, so every accepted message stays queued until
    // close purges it.
    let threaded: ThreadedProducer<producer::DeliveryContext> = ClientConfig::new()
        .set("bootstrap.servers", "127.0.0.1:1")
        .set("client.id", "keycloak-close-race")
        .set("message.timeout.ms", "60000")
        .create_with_context(producer::DeliveryContext)
        .unwrap();
    let producer = Arc::new(KafkaEventProducer::new(threaded));

    let accepted = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel();
    let barrier = Arc::new(Barrier::new(5));

    let senders: Vec<_> = (0..4)
        .map(|t| {
            let producer = Arc::clone(&producer);
            let accepted = Arc::clone(&accepted);
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..200 {
                    let tx = tx.clone();
                    let message = WireMessage {
                        topic: "keycloak-events".to_string(),
                        key: Some(format!("u-{}", t)),
                        payload: format!("{}-{}", t, i),
                    };
                    let sent = producer.send(
                        message,
                        Box::new(move |result| {
                            let _ = tx.send(result.is_ok());
                        }),
                    );
                    if sent.is_ok() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    drop(tx);

    barrier.wait();
    thread::sleep(Duration::from_millis(5));
    producer.close();
    for sender in senders {
        sender.join().unwrap();
    }

    // Every accepted message was queued before the purge, so each one reports
    // a failure promptly instead of lingering until its timeout.
    let accepted = accepted.load(Ordering::SeqCst);
    for _ in 0..accepted {
        let delivered = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!delivered);
    }

    let late = producer.send(
        WireMessage {
            topic: "keycloak-events".to_string(),
            key: None,
            payload: "late".to_string(),
        },
        Box::new(|_| panic!("callback must not run for a rejected send")),
    );
    assert!(matches!(late, Err(Error::Send { .. })));
}
