use crate::keycloak::{AdminEvent, HostEvent};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the partition key of an outgoing message is chosen.
///
/// Messages with the same key land on the same partition, so the broker keeps
/// them in the order the bridge sent them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Key every message by realm id.
    Realm,
    /// Key by the user the event concerns, falling back to the realm id.
    #[default]
    User,
    /// Send unkeyed messages; the broker spreads them across partitions.
    None,
}

impl KeyStrategy {
    pub fn extract_key(&self, event: HostEvent<'_>) -> Option<String> {
        match self {
            KeyStrategy::Realm => Some(event.realm_id().to_string()),

            KeyStrategy::User => {
                let user = match event {
                    HostEvent::Standard(event) => event.user_id.as_deref(),
                    HostEvent::Admin { event, .. } => subject_user_id(event),
                };

                match user {
                    Some(user) if !user.is_empty() => Some(user.to_string()),
                    _ => {
                        debug!(
                            event = event.label(),
                            "No user id on event, keying by realm"
                        );
                        Some(event.realm_id().to_string())
                    }
                }
            }

            KeyStrategy::None => None,
        }
    }
}

/// The user an admin operation targets, read from paths like
/// `users/{id}` or `users/{id}/role-mappings/realm`.
fn subject_user_id(event: &AdminEvent) -> Option<&str> {
    let mut segments = event.resource_path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("users"), Some(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}
