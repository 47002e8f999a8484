//! Error types and result handling for keycloak-kafka.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Startup failures ([`Error::Config`], [`Error::Connection`]) are returned to
//! the caller of [`KafkaEventListener::start`](crate::KafkaEventListener::start).
//! Steady-state failures ([`Error::Send`], [`Error::Shutdown`]) never reach the
//! host: the bridge logs and counts them instead.
//!
//! # Example
//!
//! ```rust
//! use keycloak_kafka::{Error, Result};
//!
//! fn check_client_id(client_id: &str) -> Result<()> {
//!     if client_id.is_empty() {
//!         return Err(Error::Config("client_id must not be empty".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! match check_client_id("") {
//!     Ok(()) => println!("ok"),
//!     Err(Error::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for keycloak-kafka operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid startup parameter. Fatal to bridge startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker could not be reached while building the producer. Fatal to
    /// bridge startup.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A message could not be delivered after the producer exhausted its own
    /// retries, or could not be enqueued at all.
    #[error("Send error on topic '{topic}' (key {key:?}): {message}")]
    Send {
        /// Destination topic
        topic: String,
        /// Partition key the message carried
        key: Option<String>,
        /// Description of the failure
        message: String,
    },

    /// An event arrived after the bridge began draining.
    #[error("Bridge is shutting down")]
    Shutdown,

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON encoding or decoding error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically while reading replayed events.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

impl Error {
    /// Returns `true` for errors that must abort bridge startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Connection(_))
    }
}

/// A convenient Result type alias for keycloak-kafka operations.
///
/// This is equivalent to `std::result::Result<T, keycloak_kafka::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
