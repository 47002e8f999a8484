pub mod key_strategy;
pub mod memory;
pub mod producer;
pub mod router;
pub mod serializer;

#[cfg(test)]
mod tests;

pub use key_strategy::KeyStrategy;
pub use memory::{MemoryBroker, MemoryProducer, MemoryProducerProvider};
pub use producer::{
    DeliveryCallback, DeliveryReceipt, DeliveryResult, EventProducer, KafkaEventProducer,
    KafkaProducerProvider, ProducerProvider, WireMessage,
};
pub use router::TopicRouter;
pub use serializer::{EventSerializer, JsonSerializer, SerializationFormat};
