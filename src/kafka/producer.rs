//! Producer abstraction and the rdkafka-backed implementation.
//!
//! The bridge only ever talks to [`EventProducer`] and obtains one through a
//! [`ProducerProvider`], so tests can swap in
//! [`MemoryProducerProvider`](super::MemoryProducerProvider) without a broker.

use crate::config::validate_bootstrap_servers;
use crate::{Error, Result};
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{
    BaseRecord, DeliveryResult as KafkaDeliveryResult, Producer, ProducerContext, PurgeConfig,
    ThreadedProducer,
};
use rdkafka::ClientConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};

/// One serialized event on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: String,
}

/// Where the broker stored an acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

pub type DeliveryResult = std::result::Result<DeliveryReceipt, Error>;

/// Invoked once, on a producer-owned thread, when a send reaches a terminal
/// state.
pub type DeliveryCallback = Box<dyn FnOnce(DeliveryResult) + Send + Sync + 'static>;

/// A live producer bound to string keys and string values.
///
/// Implementations must accept concurrent `send` calls from many threads
/// without external locking.
pub trait EventProducer: Send + Sync {
    /// Enqueues `message` without waiting for the broker.
    ///
    /// `Ok` means `on_delivery` will be called exactly once later. `Err` means
    /// the message was never enqueued and `on_delivery` is dropped uncalled.
    fn send(&self, message: WireMessage, on_delivery: DeliveryCallback) -> Result<()>;

    /// Blocks until every enqueued message reached a terminal state, or
    /// `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<()>;

    /// Messages enqueued but not yet acknowledged or failed.
    fn in_flight(&self) -> usize;

    /// Releases the producer. Messages still queued are abandoned and their
    /// callbacks report failure. Later sends are rejected.
    fn close(&self);
}

/// Builds producers. Called once per bridge, at startup.
pub trait ProducerProvider {
    fn create_producer(
        &self,
        client_id: &str,
        bootstrap_servers: &str,
        optional_properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn EventProducer>>;
}

/// Checks the two required producer parameters every provider needs.
pub(crate) fn validate_identity(client_id: &str, bootstrap_servers: &str) -> Result<Vec<String>> {
    if client_id.trim().is_empty() {
        return Err(Error::Config("client_id must not be empty".to_string()));
    }
    validate_bootstrap_servers(bootstrap_servers)
}

/// Routes librdkafka delivery reports to each message's callback and client
/// errors into `tracing`.
pub struct DeliveryContext;

impl ClientContext for DeliveryContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(target: "librdkafka", %error, "Client error: {}", reason);
    }
}

/// librdkafka prints its own log lines to stderr. Keep its threshold in line
/// with the most verbose level `tracing` currently lets through.
pub(crate) fn rdkafka_log_level(filter: LevelFilter) -> RDKafkaLogLevel {
    if filter >= LevelFilter::DEBUG {
        RDKafkaLogLevel::Debug
    } else if filter >= LevelFilter::INFO {
        RDKafkaLogLevel::Info
    } else if filter >= LevelFilter::WARN {
        RDKafkaLogLevel::Warning
    } else if filter >= LevelFilter::ERROR {
        RDKafkaLogLevel::Error
    } else {
        RDKafkaLogLevel::Emerg
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<DeliveryCallback>;

    fn delivery(&self, delivery_result: &KafkaDeliveryResult<'_>, on_delivery: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(message) => Ok(DeliveryReceipt {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            }),
            Err((e, message)) => Err(Error::Send {
                topic: message.topic().to_string(),
                key: message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                message: e.to_string(),
            }),
        };
        on_delivery(outcome);
    }
}

/// [`EventProducer`] over an rdkafka [`ThreadedProducer`]. Delivery callbacks
/// run on the producer's polling thread.
pub struct KafkaEventProducer {
    producer: ThreadedProducer<DeliveryContext>,
    /// Held for reading across each enqueue and for writing across the
    /// purge, so nothing is enqueued once `close` has run.
    closed: RwLock<bool>,
}

impl KafkaEventProducer {
    pub(crate) fn new(producer: ThreadedProducer<DeliveryContext>) -> Self {
        Self {
            producer,
            closed: RwLock::new(false),
        }
    }
}

impl EventProducer for KafkaEventProducer {
    fn send(&self, message: WireMessage, on_delivery: DeliveryCallback) -> Result<()> {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(Error::Send {
                topic: message.topic,
                key: message.key,
                message: "producer is closed".to_string(),
            });
        }

        let mut record: BaseRecord<'_, str, str, Box<DeliveryCallback>> =
            BaseRecord::with_opaque_to(&message.topic, Box::new(on_delivery))
                .payload(message.payload.as_str());
        if let Some(key) = &message.key {
            record = record.key(key.as_str());
        }

        self.producer.send(record).map_err(|(e, _)| Error::Send {
            topic: message.topic.clone(),
            key: message.key.clone(),
            message: e.to_string(),
        })
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout).map_err(Error::Kafka)
    }

    fn in_flight(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }

    fn close(&self) {
        let mut closed = self.closed.write().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return;
        }
        *closed = true;
        let remaining = self.in_flight();
        if remaining > 0 {
            warn!(remaining, "Purging undelivered messages on close");
            self.producer.purge(PurgeConfig::default().queue().inflight());
        }
        trace!("Kafka producer closed");
    }
}

/// Provider for real brokers. Construction probes broker metadata so an
/// unreachable cluster fails startup instead of silently buffering.
pub struct KafkaProducerProvider {
    metadata_timeout: Duration,
}

impl KafkaProducerProvider {
    pub fn new(metadata_timeout: Duration) -> Self {
        Self { metadata_timeout }
    }
}

impl Default for KafkaProducerProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ProducerProvider for KafkaProducerProvider {
    fn create_producer(
        &self,
        client_id: &str,
        bootstrap_servers: &str,
        optional_properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn EventProducer>> {
        let brokers = validate_identity(client_id, bootstrap_servers)?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", brokers.join(","))
            .set("client.id", client_id)
            .set_log_level(rdkafka_log_level(LevelFilter::current()));
        for (key, value) in optional_properties {
            client_config.set(key, value);
        }

        let producer: ThreadedProducer<DeliveryContext> = client_config
            .create_with_context(DeliveryContext)
            .map_err(|e| Error::Config(format!("Invalid producer configuration: {}", e)))?;

        let metadata = producer
            .client()
            .fetch_metadata(None, self.metadata_timeout)
            .map_err(|e| {
                Error::Connection(format!(
                    "Could not fetch metadata from {} within {:?}: {}",
                    bootstrap_servers, self.metadata_timeout, e
                ))
            })?;

        info!(
            client_id,
            brokers = metadata.brokers().len(),
            topics = metadata.topics().len(),
            "Kafka producer connected"
        );

        Ok(Arc::new(KafkaEventProducer::new(producer)))
    }
}
