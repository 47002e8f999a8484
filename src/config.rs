use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::kafka::{KeyStrategy, SerializationFormat};
use crate::keycloak::EventType;
use crate::{Error, Result};

/// librdkafka keys the typed fields below own. The pass-through bag may not
/// set them a second time.
const RESERVED_PROPERTIES: &[&str] = &[
    "bootstrap.servers",
    "client.id",
    "acks",
    "retries",
    "message.send.max.retries",
    "retry.backoff.ms",
    "compression.type",
    "request.timeout.ms",
    "message.timeout.ms",
    "delivery.timeout.ms",
    "linger.ms",
    "enable.idempotence",
];

/// Variables the deployment has always used, mapped onto the keys they set.
/// Applied as overrides so they win over the file like every other `KAFKA_*`
/// variable.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("KAFKA_TOPIC", "events_topic"),
    ("KAFKA_ADMIN_TOPIC", "admin_events_topic"),
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    #[serde(default = "default_admin_events_topic")]
    pub admin_events_topic: String,
    /// Standard event types to publish. `None` publishes every type.
    #[serde(default)]
    pub event_types: Option<Vec<EventType>>,
    #[serde(default = "default_admin_events_enabled")]
    pub admin_events_enabled: bool,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    #[serde(default)]
    pub format: SerializationFormat,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u32,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u32,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u32,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    /// Keeps per-key order across retries. Requires `acks = all`.
    #[serde(default = "default_enable_idempotence")]
    pub enable_idempotence: bool,
    /// Upper bound on the broker metadata probe done while building the
    /// producer.
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    /// Extra librdkafka properties passed through verbatim. Keys may use `_`
    /// in place of `.` (`enable_idempotence`), which keeps them expressible as
    /// environment variables.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl BridgeConfig {
    pub fn new(bootstrap_servers: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: client_id.into(),
            events_topic: default_events_topic(),
            admin_events_topic: default_admin_events_topic(),
            event_types: None,
            admin_events_enabled: default_admin_events_enabled(),
            key_strategy: KeyStrategy::default(),
            format: SerializationFormat::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
            producer: ProducerConfig::default(),
        }
    }

    /// Loads configuration from an optional TOML file, then overlays `KAFKA_*`
    /// environment variables (`KAFKA_BOOTSTRAP_SERVERS`, `KAFKA_CLIENT_ID`,
    /// `KAFKA_TOPIC`, `KAFKA_ADMIN_TOPIC`, `KAFKA_EVENTS`,
    /// `KAFKA_PRODUCER__ACKS`, ...).
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KAFKA")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("event_types")
                .try_parsing(true),
        );
        for (var, key) in LEGACY_ENV_KEYS {
            builder = builder.set_override_option(*key, std::env::var(var).ok())?;
        }
        let events = std::env::var("KAFKA_EVENTS").ok().map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<String>>()
        });
        builder = builder.set_override_option("event_types", events)?;

        builder.build()?.try_deserialize()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, config::ConfigError> {
        Self::load(Some(path.as_ref()))
    }

    /// Checks every startup parameter. Called before any producer is built.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("client_id must not be empty".to_string()));
        }
        validate_bootstrap_servers(&self.bootstrap_servers)?;
        if self.drain_timeout_ms == 0 {
            return Err(Error::Config("drain_timeout_ms must be positive".to_string()));
        }
        if let Some(types) = &self.event_types {
            if types.is_empty() {
                return Err(Error::Config(
                    "event_types is set but empty; omit it to publish every type".to_string(),
                ));
            }
        }
        self.producer.validate()
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Whether a standard event of this type should be published.
    pub fn publishes(&self, event_type: EventType) -> bool {
        match &self.event_types {
            Some(types) => types.contains(&event_type),
            None => true,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        match self.acks.as_str() {
            "0" | "1" | "-1" | "all" => {}
            other => {
                return Err(Error::Config(format!(
                    "acks must be one of 0, 1, -1, all (got '{}')",
                    other
                )))
            }
        }
        match self.compression.as_str() {
            "none" | "gzip" | "snappy" | "lz4" | "zstd" => {}
            other => {
                return Err(Error::Config(format!(
                    "Unsupported compression '{}'",
                    other
                )))
            }
        }
        if self.enable_idempotence {
            if !matches!(self.acks.as_str(), "all" | "-1") {
                return Err(Error::Config(format!(
                    "enable_idempotence requires acks = all (got '{}')",
                    self.acks
                )));
            }
            if self.retries == 0 {
                return Err(Error::Config(
                    "enable_idempotence requires retries > 0".to_string(),
                ));
            }
        }
        for key in self.properties.keys() {
            if RESERVED_PROPERTIES.contains(&normalize_property_key(key).as_str()) {
                return Err(Error::Config(format!(
                    "Property '{}' must be set through its typed field",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Flattens the typed fields and the pass-through bag into the property
    /// map handed to a [`ProducerProvider`](crate::kafka::ProducerProvider).
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut props: HashMap<String, String> = self
            .properties
            .iter()
            .map(|(k, v)| (normalize_property_key(k), v.clone()))
            .collect();
        props.insert("acks".to_string(), self.acks.clone());
        props.insert("retries".to_string(), self.retries.to_string());
        props.insert("retry.backoff.ms".to_string(), self.retry_backoff_ms.to_string());
        props.insert("compression.type".to_string(), self.compression.clone());
        props.insert("request.timeout.ms".to_string(), self.request_timeout_ms.to_string());
        props.insert("message.timeout.ms".to_string(), self.delivery_timeout_ms.to_string());
        props.insert("linger.ms".to_string(), self.linger_ms.to_string());
        props.insert(
            "enable.idempotence".to_string(),
            self.enable_idempotence.to_string(),
        );
        props
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            compression: default_compression(),
            request_timeout_ms: default_request_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            linger_ms: default_linger_ms(),
            enable_idempotence: default_enable_idempotence(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            properties: HashMap::new(),
        }
    }
}

fn normalize_property_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('_', ".")
}

/// Splits a bootstrap list into `host:port` entries, rejecting empty or
/// malformed ones.
pub fn validate_bootstrap_servers(bootstrap_servers: &str) -> Result<Vec<String>> {
    if bootstrap_servers.trim().is_empty() {
        return Err(Error::Config("bootstrap_servers must not be empty".to_string()));
    }

    bootstrap_servers
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            let (host, port) = entry.rsplit_once(':').ok_or_else(|| {
                Error::Config(format!("Broker address '{}' is not host:port", entry))
            })?;
            if host.is_empty() {
                return Err(Error::Config(format!("Broker address '{}' has no host", entry)));
            }
            match port.parse::<u16>() {
                Ok(p) if p > 0 => Ok(entry.to_string()),
                _ => Err(Error::Config(format!(
                    "Broker address '{}' has an invalid port",
                    entry
                ))),
            }
        })
        .collect()
}

fn default_events_topic() -> String {
    "keycloak-events".to_string()
}

fn default_admin_events_topic() -> String {
    "keycloak-admin-events".to_string()
}

fn default_admin_events_enabled() -> bool {
    true
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u32 {
    100
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_request_timeout_ms() -> u32 {
    30_000
}

fn default_delivery_timeout_ms() -> u32 {
    120_000
}

fn default_linger_ms() -> u32 {
    5
}

fn default_enable_idempotence() -> bool {
    true
}

fn default_metadata_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    /// `load` reads the process environment, so tests touching it run one at
    /// a time.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for (name, value) in vars {
            std::env::set_var(name, value);
        }
        let result = f();
        for (name, _) in vars {
            std::env::remove_var(name);
        }
        result
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::new("localhost:9092", "keycloak");
        assert_eq!(config.events_topic, "keycloak-events");
        assert_eq!(config.admin_events_topic, "keycloak-admin-events");
        assert!(config.admin_events_enabled);
        assert!(config.event_types.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bootstrap_validation() {
        assert_eq!(
            validate_bootstrap_servers("kafka:9092, localhost:19092").unwrap(),
            vec!["kafka:9092".to_string(), "localhost:19092".to_string()]
        );
        assert!(validate_bootstrap_servers("[::1]:9092").is_ok());
        assert!(matches!(validate_bootstrap_servers(""), Err(Error::Config(_))));
        assert!(matches!(validate_bootstrap_servers("kafka"), Err(Error::Config(_))));
        assert!(matches!(validate_bootstrap_servers(":9092"), Err(Error::Config(_))));
        assert!(matches!(validate_bootstrap_servers("kafka:port"), Err(Error::Config(_))));
        assert!(matches!(validate_bootstrap_servers("kafka:9092,"), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_client_id_rejected() {
        let config = BridgeConfig::new("localhost:9092", "  ");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_reserved_property_rejected() {
        let mut config = BridgeConfig::new("localhost:9092", "keycloak");
        config
            .producer
            .properties
            .insert("LINGER_MS".to_string(), "0".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_acks_rejected() {
        let mut config = BridgeConfig::new("localhost:9092", "keycloak");
        config.producer.acks = "most".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_to_properties_merges_extras() {
        let mut producer = ProducerConfig::default();
        producer
            .properties
            .insert("queue_buffering_max_messages".to_string(), "1000".to_string());
        producer
            .properties
            .insert("max.in.flight".to_string(), "1".to_string());
        let props = producer.to_properties();
        assert_eq!(props.get("acks").map(String::as_str), Some("all"));
        assert_eq!(props.get("retries").map(String::as_str), Some("5"));
        assert_eq!(props.get("message.timeout.ms").map(String::as_str), Some("120000"));
        assert_eq!(
            props.get("queue.buffering.max.messages").map(String::as_str),
            Some("1000")
        );
        assert_eq!(props.get("max.in.flight").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_retries_keep_key_order_by_default() {
        let producer = ProducerConfig::default();
        assert!(producer.validate().is_ok());
        let props = producer.to_properties();
        assert_eq!(props.get("enable.idempotence").map(String::as_str), Some("true"));
        assert_eq!(props.get("acks").map(String::as_str), Some("all"));

        let mut relaxed = ProducerConfig {
            acks: "1".to_string(),
            ..ProducerConfig::default()
        };
        assert!(matches!(relaxed.validate(), Err(Error::Config(_))));
        relaxed.enable_idempotence = false;
        assert!(relaxed.validate().is_ok());
        assert_eq!(
            relaxed.to_properties().get("enable.idempotence").map(String::as_str),
            Some("false")
        );

        let no_retries = ProducerConfig {
            retries: 0,
            ..ProducerConfig::default()
        };
        assert!(matches!(no_retries.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_idempotence_not_settable_through_properties() {
        let mut producer = ProducerConfig::default();
        producer
            .properties
            .insert("enable_idempotence".to_string(), "false".to_string());
        assert!(matches!(producer.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_env() {
        let config = with_env(
            &[
                ("KAFKA_BOOTSTRAP_SERVERS", "kafka1:9092,kafka2:9092"),
                ("KAFKA_CLIENT_ID", "keycloak"),
                ("KAFKA_TOPIC", "my-events"),
                ("KAFKA_ADMIN_TOPIC", "my-admin"),
                ("KAFKA_EVENTS", "LOGIN, REGISTER"),
                ("KAFKA_PRODUCER__LINGER_MS", "20"),
            ],
            || BridgeConfig::load(None),
        )
        .unwrap();

        assert_eq!(config.bootstrap_servers, "kafka1:9092,kafka2:9092");
        assert_eq!(config.client_id, "keycloak");
        assert_eq!(config.events_topic, "my-events");
        assert_eq!(config.admin_events_topic, "my-admin");
        assert_eq!(
            config.event_types,
            Some(vec![EventType::Login, EventType::Register])
        );
        assert_eq!(config.producer.linger_ms, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
bootstrap_servers = "file-kafka:9092"
client_id = "keycloak"
events_topic = "file-events"
admin_events_topic = "file-admin"
event_types = ["LOGOUT"]
"#
        )
        .unwrap();

        let config = with_env(
            &[
                ("KAFKA_BOOTSTRAP_SERVERS", "env-kafka:9092"),
                ("KAFKA_TOPIC", "env-events"),
                ("KAFKA_ADMIN_TOPIC", "env-admin"),
                ("KAFKA_EVENTS", "LOGIN"),
            ],
            || BridgeConfig::load(Some(file.path())),
        )
        .unwrap();

        assert_eq!(config.bootstrap_servers, "env-kafka:9092");
        assert_eq!(config.client_id, "keycloak");
        assert_eq!(config.events_topic, "env-events");
        assert_eq!(config.admin_events_topic, "env-admin");
        assert_eq!(config.event_types, Some(vec![EventType::Login]));
    }

    #[test]
    fn test_event_type_filter() {
        let mut config = BridgeConfig::new("localhost:9092", "keycloak");
        assert!(config.publishes(EventType::Login));
        config.event_types = Some(vec![EventType::Register]);
        assert!(config.publishes(EventType::Register));
        assert!(!config.publishes(EventType::Login));
        config.event_types = Some(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
bootstrap_servers = "kafka:9092"
client_id = "keycloak"
admin_events_topic = "audit"
event_types = ["LOGIN", "REGISTER"]

[producer]
acks = "1"
retries = 3
enable_idempotence = false

[producer.properties]
queue_buffering_max_messages = "1000"
"#
        )
        .unwrap();

        let config = with_env(&[], || BridgeConfig::from_file(file.path())).unwrap();
        assert_eq!(config.bootstrap_servers, "kafka:9092");
        assert_eq!(config.events_topic, "keycloak-events");
        assert_eq!(config.admin_events_topic, "audit");
        assert_eq!(
            config.event_types,
            Some(vec![EventType::Login, EventType::Register])
        );
        assert_eq!(config.producer.acks, "1");
        assert_eq!(config.producer.retries, 3);
        assert_eq!(config.producer.retry_backoff_ms, 100);
        let props = config.producer.to_properties();
        assert_eq!(
            props.get("queue.buffering.max.messages").map(String::as_str),
            Some("1000")
        );
        assert_eq!(props.get("enable.idempotence").map(String::as_str), Some("false"));
        assert!(config.validate().is_ok());
    }
}
