use crate::keycloak::{AdminEvent, AuthDetails, Event, EventType, HostEvent, OperationType};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    /// Single-line JSON.
    #[default]
    Json,
    /// Indented JSON, easier to read in console consumers.
    JsonPretty,
}

/// Turns a host event into the payload published on the broker.
pub trait EventSerializer: Send + Sync {
    /// Never fails for a well-formed event.
    fn serialize(&self, event: HostEvent<'_>) -> Result<String>;
}

/// Serializes events as camelCase JSON mirroring the host's own event JSON.
///
/// Nullable fields are written as explicit `null`, so consumers can tell an
/// absent value from an empty string. Admin representations are embedded as
/// JSON values rather than re-encoded strings.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    format: SerializationFormat,
}

impl JsonSerializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    fn write<T: Serialize>(&self, record: &T) -> Result<String> {
        let payload = match self.format {
            SerializationFormat::Json => serde_json::to_string(record)?,
            SerializationFormat::JsonPretty => serde_json::to_string_pretty(record)?,
        };
        Ok(payload)
    }
}

impl EventSerializer for JsonSerializer {
    fn serialize(&self, event: HostEvent<'_>) -> Result<String> {
        match event {
            HostEvent::Standard(event) => self.write(&EventRecord::from(event)),
            HostEvent::Admin {
                event,
                include_representation,
            } => self.write(&AdminEventRecord::new(event, include_representation)),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord<'a> {
    id: Option<&'a str>,
    time: i64,
    #[serde(rename = "type")]
    event_type: EventType,
    realm_id: &'a str,
    client_id: Option<&'a str>,
    user_id: Option<&'a str>,
    session_id: Option<&'a str>,
    ip_address: Option<&'a str>,
    error: Option<&'a str>,
    details: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a Event> for EventRecord<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            id: event.id.as_deref(),
            time: event.time,
            event_type: event.event_type,
            realm_id: &event.realm_id,
            client_id: event.client_id.as_deref(),
            user_id: event.user_id.as_deref(),
            session_id: event.session_id.as_deref(),
            ip_address: event.ip_address.as_deref(),
            error: event.error.as_deref(),
            details: &event.details,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminEventRecord<'a> {
    id: Option<&'a str>,
    time: i64,
    realm_id: &'a str,
    auth_details: &'a AuthDetails,
    resource_type: &'a str,
    operation_type: OperationType,
    resource_path: &'a str,
    representation: Option<Representation<'a>>,
    error: Option<&'a str>,
}

impl<'a> AdminEventRecord<'a> {
    fn new(event: &'a AdminEvent, include_representation: bool) -> Self {
        let representation = if include_representation {
            event.representation.as_deref().map(Representation::parse)
        } else {
            None
        };

        Self {
            id: event.id.as_deref(),
            time: event.time,
            realm_id: &event.realm_id,
            auth_details: &event.auth_details,
            resource_type: &event.resource_type,
            operation_type: event.operation_type,
            resource_path: &event.resource_path,
            representation,
            error: event.error.as_deref(),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Representation<'a> {
    /// Valid JSON, written through untouched.
    Json(&'a RawValue),
    /// Anything else, written as a JSON string.
    Text(&'a str),
}

impl<'a> Representation<'a> {
    fn parse(text: &'a str) -> Self {
        match serde_json::from_str::<&RawValue>(text) {
            Ok(raw) => Representation::Json(raw),
            Err(e) => {
                debug!("Representation is not JSON ({}), embedding as text", e);
                Representation::Text(text)
            }
        }
    }
}
