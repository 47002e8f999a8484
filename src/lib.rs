pub mod bridge;
pub mod config;
pub mod error;

pub mod kafka;
pub mod keycloak;

pub use bridge::{BridgeState, BridgeStats, EventListener, KafkaEventListener, ShutdownReport};
pub use config::{BridgeConfig, ProducerConfig};
pub use error::{Error, Result};
