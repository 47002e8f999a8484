#![allow(dead_code)]

use keycloak_kafka::kafka::{MemoryBroker, MemoryProducerProvider};
use keycloak_kafka::keycloak::{AdminEvent, AuthDetails, Event, EventType, OperationType};
use keycloak_kafka::BridgeConfig;
use std::env;

pub const EVENTS_TOPIC: &str = "keycloak-events";
pub const ADMIN_EVENTS_TOPIC: &str = "keycloak-admin-events";

/// Test configuration; brokers come from `TEST_KAFKA_BROKERS` when set.
pub fn get_test_config() -> BridgeConfig {
    let brokers =
        env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    let mut config = BridgeConfig::new(brokers, "keycloak");
    config.drain_timeout_ms = 5_000;
    config.producer.linger_ms = 0;
    config.producer.retry_backoff_ms = 10;
    config
}

pub fn memory_provider() -> (MemoryBroker, MemoryProducerProvider) {
    let broker = MemoryBroker::new();
    let provider = MemoryProducerProvider::new(broker.clone());
    (broker, provider)
}

pub fn login_event(realm: &str, user: &str) -> Event {
    Event::new(EventType::Login, realm)
        .with_client("account")
        .with_user(user)
        .with_ip("10.0.0.1")
}

pub fn admin_auth() -> AuthDetails {
    let mut auth = AuthDetails::new("master");
    auth.client_id = Some("admin-cli".to_string());
    auth.user_id = Some("admin-id".to_string());
    auth.ip_address = Some("127.0.0.1".to_string());
    auth
}

pub fn user_admin_event(op: OperationType, user_id: &str, representation: &str) -> AdminEvent {
    AdminEvent::new(op, "USER", format!("users/{}", user_id), admin_auth())
        .with_representation(representation)
}
