use crate::keycloak::HostEvent;
use crate::{Error, Result};

const MAX_TOPIC_LEN: usize = 249;

/// Maps each host event variant to its destination topic.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    events_topic: String,
    admin_events_topic: String,
}

impl TopicRouter {
    pub fn new(events_topic: impl Into<String>, admin_events_topic: impl Into<String>) -> Result<Self> {
        let events_topic = events_topic.into();
        let admin_events_topic = admin_events_topic.into();
        validate_topic_name("events_topic", &events_topic)?;
        validate_topic_name("admin_events_topic", &admin_events_topic)?;

        Ok(Self {
            events_topic,
            admin_events_topic,
        })
    }

    pub fn topic_for(&self, event: HostEvent<'_>) -> &str {
        match event {
            HostEvent::Standard(_) => &self.events_topic,
            HostEvent::Admin { .. } => &self.admin_events_topic,
        }
    }

    pub fn events_topic(&self) -> &str {
        &self.events_topic
    }

    pub fn admin_events_topic(&self) -> &str {
        &self.admin_events_topic
    }
}

/// Kafka accepts at most 249 characters from `[a-zA-Z0-9._-]`, and reserves
/// `.` and `..`.
fn validate_topic_name(field: &str, topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Config(format!("{} must not be empty", field)));
    }
    if topic == "." || topic == ".." {
        return Err(Error::Config(format!("{} cannot be '{}'", field, topic)));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::Config(format!(
            "{} is longer than {} characters",
            field, MAX_TOPIC_LEN
        )));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(Error::Config(format!(
            "{} '{}' contains illegal character '{}'",
            field, topic, c
        )));
    }
    Ok(())
}
